//! Argument building for the `ssh` binary.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Failed to quote argument: {0}")]
    QuoteError(#[from] shlex::QuoteError),
    #[error("Remote command is empty")]
    EmptyCommand,
}

/// Quote a single word for the remote POSIX shell.
///
/// # Errors
/// Returns error if the input contains a NUL byte.
pub fn quote(word: &str) -> Result<String, CommandBuildError> {
    Ok(shlex::try_quote(word)?.into_owned())
}

/// Where and how to reach the remote host.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Control socket shared by the master and every channel.
    pub control_path: PathBuf,
    pub identity_file: Option<PathBuf>,
    /// Whether authentication is by password (prompted through `sshpass`).
    pub password_auth: bool,
}

impl SshTarget {
    fn destination(&self, args: &mut Vec<String>) {
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push("-l".to_string());
        args.push(self.username.clone());
        args.push(self.host.clone());
    }

    fn control(&self, args: &mut Vec<String>) {
        args.push("-S".to_string());
        args.push(self.control_path.display().to_string());
    }

    fn option(args: &mut Vec<String>, opt: impl Into<String>) {
        args.push("-o".to_string());
        args.push(opt.into());
    }

    /// Arguments for the long-lived master connection.
    #[must_use]
    pub fn master_args(&self, connect_timeout: Duration) -> Vec<String> {
        let mut args = vec!["-M".to_string(), "-N".to_string()];
        self.control(&mut args);
        Self::option(&mut args, "ControlPersist=no");
        Self::option(
            &mut args,
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        );
        Self::option(&mut args, "StrictHostKeyChecking=accept-new");
        Self::option(&mut args, "ServerAliveInterval=15");
        Self::option(&mut args, "ServerAliveCountMax=3");

        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
            Self::option(&mut args, "IdentitiesOnly=yes");
        }

        if self.password_auth {
            Self::option(
                &mut args,
                "PreferredAuthentications=password,keyboard-interactive",
            );
            Self::option(&mut args, "PubkeyAuthentication=no");
        } else {
            Self::option(&mut args, "BatchMode=yes");
        }

        self.destination(&mut args);
        args
    }

    /// Arguments asking the master whether it is up.
    #[must_use]
    pub fn check_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        self.control(&mut args);
        args.push("-O".to_string());
        args.push("check".to_string());
        self.destination(&mut args);
        args
    }

    /// Arguments asking the master to exit.
    #[must_use]
    pub fn exit_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        self.control(&mut args);
        args.push("-O".to_string());
        args.push("exit".to_string());
        self.destination(&mut args);
        args
    }

    /// Arguments for one channel running `remote_command` over the master.
    ///
    /// # Errors
    /// Returns error if the command is empty.
    pub fn exec_args(&self, remote_command: &str) -> Result<Vec<String>, CommandBuildError> {
        if remote_command.trim().is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let mut args = Vec::new();
        self.control(&mut args);
        Self::option(&mut args, "ControlMaster=no");
        Self::option(&mut args, "BatchMode=yes");
        args.push("-T".to_string());
        self.destination(&mut args);
        args.push("--".to_string());
        args.push(remote_command.to_string());
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "example.com".into(),
            port: 2222,
            username: "deploy".into(),
            control_path: PathBuf::from("/tmp/rs-test.sock"),
            identity_file: Some(PathBuf::from("/home/deploy/.ssh/id_ed25519")),
            password_auth: false,
        }
    }

    #[test]
    fn test_master_args() {
        let args = target().master_args(Duration::from_millis(10_000));
        assert_eq!(&args[..2], ["-M", "-N"]);
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/home/deploy/.ssh/id_ed25519".to_string()));
        assert_eq!(args.last().unwrap(), "example.com");
    }

    #[test]
    fn test_password_master_is_interactive() {
        let args = SshTarget {
            identity_file: None,
            password_auth: true,
            ..target()
        }
        .master_args(Duration::from_millis(200));
        assert!(args.contains(&"ConnectTimeout=1".to_string()));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn test_exec_args_end_with_command() {
        let args = target().exec_args("cd /srv && node runner.cjs").unwrap();
        let dashdash = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[dashdash - 1], "example.com");
        assert_eq!(args[dashdash + 1], "cd /srv && node runner.cjs");
        assert!(target().exec_args("   ").is_err());
    }

    #[test]
    fn test_quote() {
        for word in ["/srv/app", "/srv/my app", "it's $HOME"] {
            let quoted = quote(word).unwrap();
            assert_eq!(shlex::split(&quoted).unwrap(), vec![word.to_string()]);
        }
        assert!(quote("a\0b").is_err());
    }
}
