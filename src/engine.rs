//! Engine adapters: the pluggable capability that produces a database dump.
//!
//! The executor only depends on the `EngineAdapter` trait; the command
//! implementation shells out to the engine's native dump tool and streams
//! its output to a staging file, never holding the dump in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    MySql,
    Postgres,
    SqlServer,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::MySql => "mysql",
            EngineKind::Postgres => "postgres",
            EngineKind::SqlServer => "sqlserver",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mysql" => Ok(EngineKind::MySql),
            "postgres" => Ok(EngineKind::Postgres),
            "sqlserver" => Ok(EngineKind::SqlServer),
            other => Err(Error::Engine(format!("unknown engine: {}", other))),
        }
    }
}

/// Concrete connection coordinates for one dump, after credential
/// inheritance has been resolved.
#[derive(Debug, Clone)]
pub struct DumpTarget {
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Capability that writes a full dump of `target` to `dest`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    async fn dump(&self, target: &DumpTarget, dest: &Path) -> Result<()>;
}

/// Adapter that invokes the engine's native dump tooling.
pub struct CommandEngineAdapter;

impl CommandEngineAdapter {
    /// mysqldump argument list. The password travels via MYSQL_PWD, not argv.
    fn mysql_args(target: &DumpTarget) -> Vec<String> {
        vec![
            "--host".to_string(),
            target.host.clone(),
            "--port".to_string(),
            target.port.to_string(),
            "--user".to_string(),
            target.username.clone(),
            "--single-transaction".to_string(),
            "--routines".to_string(),
            target.database.clone(),
        ]
    }

    /// pg_dump argument list. The password travels via PGPASSWORD.
    fn postgres_args(target: &DumpTarget) -> Vec<String> {
        vec![
            "--host".to_string(),
            target.host.clone(),
            "--port".to_string(),
            target.port.to_string(),
            "--username".to_string(),
            target.username.clone(),
            "--format=plain".to_string(),
            "--no-password".to_string(),
            target.database.clone(),
        ]
    }

    /// sqlpackage export arguments. Unlike the others, sqlpackage writes the
    /// target file itself instead of streaming to stdout.
    fn sqlpackage_args(target: &DumpTarget, dest: &Path) -> Vec<String> {
        vec![
            "/Action:Export".to_string(),
            format!("/TargetFile:{}", dest.display()),
            format!(
                "/SourceConnectionString:Server={},{};Database={};User Id={};Password={}",
                target.host, target.port, target.database, target.username, target.password
            ),
        ]
    }

    async fn dump_via_stdout(
        &self,
        program: &str,
        args: Vec<String>,
        env: (&str, &str),
        dest: &Path,
    ) -> Result<()> {
        let mut child = Command::new(program)
            .args(&args)
            .env(env.0, env.1)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Engine(format!("failed to spawn {}: {}", program, e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine(format!("{} produced no stdout", program)))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Engine(format!("{} produced no stderr", program)))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let copy = tokio::io::copy(&mut stdout, &mut file);

        let mut err_buf = String::new();
        let stderr_read = stderr.read_to_string(&mut err_buf);

        let (copied, _) = tokio::try_join!(copy, stderr_read)?;

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Engine(format!("{} did not exit cleanly: {}", program, e)))?;

        if !status.success() {
            return Err(Error::Engine(format!(
                "{} exited with {}: {}",
                program,
                status,
                err_buf.trim()
            )));
        }
        tracing::debug!("{} wrote {} bytes to staging", program, copied);
        Ok(())
    }

    async fn dump_via_target_file(
        &self,
        program: &str,
        args: Vec<String>,
        dest: &Path,
    ) -> Result<()> {
        let output = Command::new(program)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Engine(format!("failed to spawn {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(Error::Engine(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !dest.exists() {
            return Err(Error::Engine(format!(
                "{} reported success but wrote no file",
                program
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineAdapter for CommandEngineAdapter {
    async fn dump(&self, target: &DumpTarget, dest: &Path) -> Result<()> {
        match target.engine {
            EngineKind::MySql => {
                self.dump_via_stdout(
                    "mysqldump",
                    Self::mysql_args(target),
                    ("MYSQL_PWD", &target.password),
                    dest,
                )
                .await
            }
            EngineKind::Postgres => {
                self.dump_via_stdout(
                    "pg_dump",
                    Self::postgres_args(target),
                    ("PGPASSWORD", &target.password),
                    dest,
                )
                .await
            }
            EngineKind::SqlServer => {
                self.dump_via_target_file("sqlpackage", Self::sqlpackage_args(target, dest), dest)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target(engine: EngineKind) -> DumpTarget {
        DumpTarget {
            engine,
            host: "db.internal".to_string(),
            port: 5432,
            username: "backup".to_string(),
            password: "s3cret".to_string(),
            database: "app".to_string(),
        }
    }

    #[test]
    fn test_mysql_args_omit_password() {
        let args = CommandEngineAdapter::mysql_args(&target(EngineKind::MySql));
        assert!(args.contains(&"--single-transaction".to_string()));
        assert_eq!(args.last().unwrap(), "app");
        assert!(!args.iter().any(|a| a.contains("s3cret")));
    }

    #[test]
    fn test_postgres_args_omit_password() {
        let args = CommandEngineAdapter::postgres_args(&target(EngineKind::Postgres));
        assert!(args.contains(&"--no-password".to_string()));
        assert!(args.contains(&"5432".to_string()));
        assert!(!args.iter().any(|a| a.contains("s3cret")));
    }

    #[test]
    fn test_sqlpackage_args_point_at_dest() {
        let dest = PathBuf::from("/tmp/out.bacpac");
        let args = CommandEngineAdapter::sqlpackage_args(&target(EngineKind::SqlServer), &dest);
        assert_eq!(args[0], "/Action:Export");
        assert!(args[1].ends_with("/tmp/out.bacpac"));
        assert!(args[2].contains("Server=db.internal,5432"));
        assert!(args[2].contains("Database=app"));
    }

    #[test]
    fn test_engine_kind_round_trip() {
        for kind in [EngineKind::MySql, EngineKind::Postgres, EngineKind::SqlServer] {
            assert_eq!(kind.as_str().parse::<EngineKind>().unwrap(), kind);
        }
        assert!("oracle".parse::<EngineKind>().is_err());
    }
}
