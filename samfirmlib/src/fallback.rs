use crate::fus::DownloadRequest;

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::process::Command;

/// Downloads are multiple gigabytes, even over many connections.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

const CONNECTIONS: u32 = 16;
const MAX_TRIES: u32 = 5;
const RETRY_WAIT_SECS: u32 = 3;
const TIMEOUT_SECS: u32 = 60;
const CONNECT_TIMEOUT_SECS: u32 = 30;

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("Output path has no parent directory or file name: {0:?}")]
    InvalidOutput(PathBuf),
    #[error("Failed to write downloader config {0:?}: {1}")]
    Config(PathBuf, #[source] io::Error),
    #[error("Failed to launch {0:?}: {1}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("Failed to wait for downloader: {0}")]
    Wait(#[source] io::Error),
    #[error("Downloader did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Downloader failed: {0}")]
    ExitStatus(ExitStatus),
    #[error("Downloader did not produce any data at {0:?}")]
    EmptyOutput(PathBuf),
}

/// Removes the config file when dropped.
struct ConfigFile(PathBuf);

impl Drop for ConfigFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => debug!("Deleted downloader config: {:?}", self.0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete downloader config {:?}: {e}", self.0),
        }
    }
}

/// Hands the download off to aria2c, which can use many connections.
#[derive(Clone, Debug)]
pub struct ExternalDownloader {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

impl ExternalDownloader {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Arguments passed before the generated ones.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Contents of the aria2c config file for downloading to `dir/file_name`.
    pub fn config(request: &DownloadRequest, dir: &Path, file_name: &str) -> String {
        let mut lines = vec![
            "continue=true".to_owned(),
            format!("max-connection-per-server={CONNECTIONS}"),
            format!("split={CONNECTIONS}"),
            "min-split-size=1M".to_owned(),
            "max-download-limit=0".to_owned(),
            format!("max-tries={MAX_TRIES}"),
            format!("retry-wait={RETRY_WAIT_SECS}"),
            format!("timeout={TIMEOUT_SECS}"),
            format!("connect-timeout={CONNECT_TIMEOUT_SECS}"),
            "allow-overwrite=true".to_owned(),
            "auto-file-renaming=false".to_owned(),
            "disable-ipv6=true".to_owned(),
            "no-conf=true".to_owned(),
            "file-allocation=none".to_owned(),
            "console-log-level=warn".to_owned(),
            format!("dir={}", dir.display()),
            format!("out={file_name}"),
        ];

        for (name, value) in &request.headers {
            lines.push(format!("header={name}: {value}"));
        }

        let mut config = lines.join("\n");
        config.push('\n');
        config
    }

    /// Download `request` to `output`. Succeeds only if the downloader exits
    /// cleanly in time and `output` is non-empty afterwards.
    pub async fn download(&self, request: &DownloadRequest, output: &Path) -> Result<(), FallbackError> {
        let (dir, file_name) = match (output.parent(), output.file_name().and_then(|n| n.to_str())) {
            (Some(d), Some(n)) => (if d.as_os_str().is_empty() { Path::new(".") } else { d }, n),
            _ => return Err(FallbackError::InvalidOutput(output.to_owned())),
        };

        let config_path = dir.join(format!(".aria2_{}.conf", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&config_path, Self::config(request, dir, file_name))
            .await
            .map_err(|e| FallbackError::Config(config_path.clone(), e))?;
        let _guard = ConfigFile(config_path.clone());

        debug!("Launching {:?} with config {config_path:?}", self.program);

        let mut conf_arg = OsString::from("--conf-path=");
        conf_arg.push(&config_path);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(conf_arg)
            .arg(&request.url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FallbackError::Spawn(self.program.clone(), e))?;

        let status = tokio::select! {
            status = child.wait() => status.map_err(FallbackError::Wait)?,
            _ = tokio::time::sleep(self.timeout) => {
                warn!("{:?} timed out; killing it", self.program);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {:?}: {e}", self.program);
                }
                return Err(FallbackError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            return Err(FallbackError::ExitStatus(status));
        }

        match tokio::fs::metadata(output).await {
            Ok(m) if m.len() > 0 => {
                info!("External download complete: {output:?} ({} bytes)", m.len());
                Ok(())
            }
            _ => Err(FallbackError::EmptyOutput(output.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request() -> DownloadRequest {
        DownloadRequest {
            url: "http://localhost/NF_DownloadBinaryForMass.do?file=/a/b.zip.enc4".to_owned(),
            headers: vec![
                ("User-Agent", "Kies2.0_FUS".to_owned()),
                ("Authorization", "FUS nonce=\"n\"".to_owned()),
            ],
        }
    }

    fn leftover_configs(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(".aria2_"))
            .count()
    }

    #[test]
    fn test_config() {
        let config = ExternalDownloader::config(&request(), Path::new("/tmp/out"), "b.zip.enc4");
        let lines: Vec<&str> = config.lines().collect();

        assert!(lines.contains(&"continue=true"));
        assert!(lines.contains(&"split=16"));
        assert!(lines.contains(&"max-tries=5"));
        assert!(lines.contains(&"disable-ipv6=true"));
        assert!(lines.contains(&"dir=/tmp/out"));
        assert!(lines.contains(&"out=b.zip.enc4"));
        assert!(lines.contains(&"header=User-Agent: Kies2.0_FUS"));
        assert!(lines.contains(&"header=Authorization: FUS nonce=\"n\""));
        assert!(config.ends_with('\n'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("b.zip.enc4");

        let result = ExternalDownloader::new("false").download(&request(), &output).await;

        assert_matches!(result, Err(FallbackError::ExitStatus(s)) if s.code() == Some(1));
        assert_eq!(leftover_configs(dir.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("b.zip.enc4");

        let result = ExternalDownloader::new("true").download(&request(), &output).await;

        assert_matches!(result, Err(FallbackError::EmptyOutput(p)) if p == output);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("b.zip.enc4");

        let result = ExternalDownloader::new("sh")
            .args(["-c", "sleep 30", "sh"])
            .timeout(Duration::from_millis(200))
            .download(&request(), &output)
            .await;

        assert_matches!(result, Err(FallbackError::Timeout(_)));
        assert_eq!(leftover_configs(dir.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("b.zip.enc4");
        let script = r#"
            conf="${1#--conf-path=}"
            while IFS= read -r line; do
                case "$line" in
                    dir=*) dir="${line#dir=}" ;;
                    out=*) out="${line#out=}" ;;
                esac
            done < "$conf"
            printf 'payload' > "$dir/$out"
        "#;

        ExternalDownloader::new("sh")
            .args(["-c", script, "sh"])
            .download(&request(), &output)
            .await
            .unwrap();

        assert_eq!(fs::read(&output).unwrap(), b"payload");
        assert_eq!(leftover_configs(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("b.zip.enc4");

        let result = ExternalDownloader::new(dir.path().join("does-not-exist"))
            .download(&request(), &output)
            .await;

        assert_matches!(result, Err(FallbackError::Spawn(_, _)));
        assert_eq!(leftover_configs(dir.path()), 0);
    }
}
