use thiserror::Error;

/// Failure classes for a device session.
///
/// Only `Build` is recoverable: the owning scheduler parks the device in a
/// paused state and keeps the process alive. `VersionUnsupported` is raised
/// once, at session start. Everything else surfaces as `Backend` and is fatal
/// to the session that observed it; restarting is the supervisor's call.
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("OpenCL {version} is not supported; minimum required version is 1.2")]
    VersionUnsupported { version: String },

    #[error("OpenCL kernel build failed")]
    Build { log: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MinerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn backend_errors_keep_their_context() {
        let err = MinerError::from(anyhow!("failed to create command queue: CL_OUT_OF_RESOURCES"));
        assert!(err.to_string().contains("command queue"));
    }

    #[test]
    fn version_error_names_the_minimum() {
        let err = MinerError::VersionUnsupported {
            version: "OpenCL 1.1 Mesa".to_string(),
        };
        assert!(err.to_string().contains("1.2"));
    }
}
