//! Container engine abstraction and the `docker`/`podman` CLI driver.

use async_trait::async_trait;
use infra_core::{Credential, InfraError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Everything needed for one `build` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build context directory.
    pub context_dir: PathBuf,

    /// Containerfile path.
    pub containerfile: PathBuf,

    /// Tags applied to the built image (first one names the image in errors).
    pub tags: Vec<String>,

    /// `--build-arg` values.
    pub build_args: BTreeMap<String, String>,

    /// File receiving the build output, if any.
    pub log_file: Option<PathBuf>,

    /// Human-readable description for logs.
    pub description: String,
}

impl BuildRequest {
    pub fn new(context_dir: PathBuf, containerfile: PathBuf, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            context_dir,
            containerfile,
            description: format!("Building {}", tag),
            tags: vec![tag],
            build_args: BTreeMap::new(),
            log_file: None,
        }
    }

    pub fn with_build_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.build_args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Name used for the image in errors.
    pub fn image(&self) -> &str {
        self.tags.first().map(String::as_str).unwrap_or("<untagged>")
    }

    /// Arguments after the program name.
    pub fn build_args_cli(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--file".to_string(),
            self.containerfile.to_string_lossy().into_owned(),
        ];
        for tag in &self.tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        for (key, value) in &self.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.context_dir.to_string_lossy().into_owned());
        args
    }
}

/// Operations the pipeline needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Build an image; failure is an [`InfraError::Build`].
    async fn build(&self, request: &BuildRequest) -> Result<()>;

    /// Whether `reference` exists in the local image store.
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Add `target` as another name for `source`.
    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    /// Authenticate against `registry`.
    async fn login(&self, registry: &str, credential: &Credential) -> Result<()>;

    /// Push `reference` to its registry.
    async fn push(&self, reference: &str) -> Result<()>;
}

/// Engine driving the `docker` or `podman` command line.
#[derive(Debug, Clone)]
pub struct CliEngine {
    program: String,
}

impl CliEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Engine named by `INFRA_CONTAINER_ENGINE`, else `docker`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("INFRA_CONTAINER_ENGINE").unwrap_or_else(|_| "docker".to_string()))
    }

    async fn output(&self, args: &[&str], stdin: Option<&str>) -> std::io::Result<Output> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        child.wait_with_output().await
    }

    fn failure_message(&self, output: &Output) -> String {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            format!(
                "{} exited with code {}",
                self.program,
                output.status.code().unwrap_or(-1)
            )
        } else {
            stderr.to_string()
        }
    }
}

/// Next output line, decoded lossily; `None` at end of stream.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

async fn write_log(log: &mut Option<File>, line: &str) -> std::io::Result<()> {
    if let Some(file) = log.as_mut() {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    Ok(())
}

fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("error") || lower.contains(" error:") || lower.contains("error: ")
}

#[async_trait]
impl ContainerEngine for CliEngine {
    fn name(&self) -> &str {
        &self.program
    }

    async fn build(&self, request: &BuildRequest) -> Result<()> {
        let build_error = |message: String| InfraError::Build {
            image: request.image().to_string(),
            message,
        };

        info!(engine = %self.program, image = %request.image(), "{}", request.description);

        let mut child = Command::new(&self.program)
            .args(request.build_args_cli())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| build_error(format!("cannot start {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| build_error("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| build_error("stderr not captured".to_string()))?;

        let mut log = match &request.log_file {
            Some(path) => Some(File::create(path).await?),
            None => None,
        };

        let mut out_reader = BufReader::new(stdout);
        let mut err_reader = BufReader::new(stderr);
        let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
        let (mut out_done, mut err_done) = (false, false);
        let mut last_error: Option<String> = None;

        while !(out_done && err_done) {
            let (from_stdout, line) = tokio::select! {
                line = next_line(&mut out_reader, &mut out_buf), if !out_done => (true, line?),
                line = next_line(&mut err_reader, &mut err_buf), if !err_done => (false, line?),
            };
            match line {
                Some(line) => {
                    debug!(image = %request.image(), "{}", line);
                    if is_error_line(&line) {
                        last_error = Some(line.clone());
                    }
                    write_log(&mut log, &line).await?;
                }
                None if from_stdout => out_done = true,
                None => err_done = true,
            }
        }

        if let Some(mut file) = log {
            file.flush().await?;
            if let Some(path) = &request.log_file {
                info!(path = %path.display(), "Build log saved");
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let message = last_error.unwrap_or_else(|| {
                format!("{} build exited with code {}", self.program, status.code().unwrap_or(-1))
            });
            return Err(build_error(message));
        }

        info!(image = %request.image(), "Successfully built");
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let output = self.output(&["image", "inspect", reference], None).await?;
        Ok(output.status.success())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let output = self
            .output(&["tag", source, target], None)
            .await
            .map_err(|e| InfraError::Publish {
                reference: target.to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(InfraError::Publish {
                reference: target.to_string(),
                message: self.failure_message(&output),
            });
        }
        Ok(())
    }

    async fn login(&self, registry: &str, credential: &Credential) -> Result<()> {
        let output = self
            .output(
                &["login", registry, "--username", &credential.username, "--password-stdin"],
                Some(&credential.token),
            )
            .await
            .map_err(|e| InfraError::Publish {
                reference: registry.to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(InfraError::Publish {
                reference: registry.to_string(),
                message: format!("login failed: {}", self.failure_message(&output)),
            });
        }
        debug!(registry = %registry, user = %credential.username, "Logged in");
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<()> {
        let output = self
            .output(&["push", reference], None)
            .await
            .map_err(|e| InfraError::Publish {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            warn!(reference = %reference, "Push failed");
            return Err(InfraError::Publish {
                reference: reference.to_string(),
                message: self.failure_message(&output),
            });
        }
        Ok(())
    }
}

/// Engine that only logs what it would do.
#[derive(Debug, Clone, Default)]
pub struct DryRunEngine;

#[async_trait]
impl ContainerEngine for DryRunEngine {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn build(&self, request: &BuildRequest) -> Result<()> {
        info!(
            containerfile = %request.containerfile.display(),
            tags = ?request.tags,
            build_args = ?request.build_args,
            log_file = ?request.log_file,
            "[DRY RUN] Would build: {}",
            request.description
        );
        Ok(())
    }

    async fn image_exists(&self, _reference: &str) -> Result<bool> {
        Ok(true)
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        info!(source = %source, target = %target, "[DRY RUN] Would tag");
        Ok(())
    }

    async fn login(&self, registry: &str, credential: &Credential) -> Result<()> {
        info!(registry = %registry, user = %credential.username, "[DRY RUN] Would log in");
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<()> {
        info!(reference = %reference, "[DRY RUN] Would push");
        Ok(())
    }
}
