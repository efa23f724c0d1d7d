use thiserror::Error;

/// Failure categories that the command line maps onto exit codes.
///
/// Modules propagate `anyhow::Error` with context; one of these is placed at
/// the root of the chain wherever a failure crosses a taxonomy boundary.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backup creation failed: {0}")]
    BackupCreation(String),

    #[error("Backup file is corrupt: {0}")]
    BackupCorrupt(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Backup file error: {0}")]
    BackupFile(String),

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Operation cancelled by user")]
    UserCancelled,
}

/// The command whose exit code table applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Backup,
    Restore,
    Verify,
}

pub const EXIT_GENERAL: u8 = 1;

impl PipelineError {
    pub fn exit_code(&self, command: Command) -> u8 {
        use PipelineError::*;
        match (command, self) {
            (_, Configuration(_)) => 2,
            (_, Connection(_)) => 3,

            (Command::Backup, BackupCreation(_)) => 4,
            (Command::Backup, Verification(_) | BackupCorrupt(_) | ChecksumMismatch { .. }) => 5,
            (Command::Backup, Upload(_)) => 6,
            (Command::Backup, Cleanup(_)) => 7,

            (Command::Restore, BackupFile(_) | BackupCorrupt(_) | ChecksumMismatch { .. }) => 4,
            (Command::Restore, Upload(_)) => 4,
            (Command::Restore, Restore(_)) => 5,
            (Command::Restore, Verification(_)) => 6,
            (Command::Restore, UserCancelled) => 7,

            (Command::Verify, Verification(_)) => 4,
            (Command::Verify, BackupFile(_) | BackupCorrupt(_) | ChecksumMismatch { .. }) => 4,

            _ => EXIT_GENERAL,
        }
    }
}

/// Finds the first taxonomy error anywhere in an `anyhow` chain.
pub fn classify(err: &anyhow::Error) -> Option<&PipelineError> {
    err.downcast_ref::<PipelineError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>()))
}

/// Exit code for an error escaping `command`; untyped failures are general errors.
pub fn exit_code_for(err: &anyhow::Error, command: Command) -> u8 {
    classify(err).map_or(EXIT_GENERAL, |e| e.exit_code(command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_codes_per_command() {
        let upload = PipelineError::Upload("bucket unreachable".into());
        assert_eq!(upload.exit_code(Command::Backup), 6);

        let corrupt = PipelineError::BackupCorrupt("bad gzip".into());
        assert_eq!(corrupt.exit_code(Command::Restore), 4);
        assert_eq!(corrupt.exit_code(Command::Backup), 5);

        assert_eq!(PipelineError::UserCancelled.exit_code(Command::Restore), 7);
        assert_eq!(PipelineError::Restore("boom".into()).exit_code(Command::Restore), 5);
        assert_eq!(PipelineError::Verification("x".into()).exit_code(Command::Restore), 6);
        assert_eq!(PipelineError::Verification("x".into()).exit_code(Command::Verify), 4);
        assert_eq!(PipelineError::Cleanup("x".into()).exit_code(Command::Backup), 7);
        assert_eq!(PipelineError::Configuration("x".into()).exit_code(Command::Verify), 2);
    }

    #[test]
    fn test_classify_looks_through_context() {
        let err: anyhow::Error = Err::<(), _>(PipelineError::Connection("refused".into()))
            .context("Failed to reach source database")
            .context("Backup process failed")
            .unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Backup), 3);

        let untyped = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&untyped, Command::Restore), EXIT_GENERAL);
    }
}
