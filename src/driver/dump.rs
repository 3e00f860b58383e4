//! Vendor dump/restore tooling.
//!
//! Drivers describe the tool to run as a [`ToolCommand`]; this module spawns
//! it with `tokio::process`, wires its stdin/stdout to the target file and
//! optionally pipes the stream through `gzip`/`gunzip`. A missing binary or
//! a non-zero exit status is a [`DbError::Dump`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::{ATTR_GZIP, ConnectionParameters};
use crate::error::{DbError, DbResult};

/// A vendor binary plus its arguments and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }

    fn spawn(&self, stdin: Stdio, stdout: Stdio) -> DbResult<Child> {
        self.command()
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.program, e))
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> DbError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DbError::dump(program, "binary not found in PATH")
    } else {
        DbError::dump(program, err.to_string())
    }
}

/// Whether a dump/restore of `path` goes through gzip.
pub fn wants_gzip(params: &ConnectionParameters, path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
        || params.bool_attribute(ATTR_GZIP, false)
}

/// The configured override for a tool binary, or its default name.
pub fn tool_binary(params: &ConnectionParameters, attribute: &str, default: &str) -> String {
    params
        .attribute(attribute)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

async fn wait_success(program: &str, child: Child) -> DbResult<()> {
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| DbError::dump(program, e.to_string()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(DbError::dump(
        program,
        format!("exited with {}: {}", output.status, stderr.trim()),
    ))
}

async fn create_file(path: &Path, tool: &str) -> DbResult<Stdio> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| DbError::dump(tool, format!("cannot create {}: {e}", path.display())))?;
    Ok(Stdio::from(file.into_std().await))
}

async fn open_file(path: &Path, tool: &str) -> DbResult<Stdio> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| DbError::dump(tool, format!("cannot open {}: {e}", path.display())))?;
    Ok(Stdio::from(file.into_std().await))
}

/// Run `tool` and write its stdout to `path`, optionally gzip-compressed.
pub async fn dump_to_file(tool: &ToolCommand, path: &Path, gzip: bool) -> DbResult<()> {
    debug!(program = %tool.program, path = %path.display(), gzip, "Running dump tool");

    if !gzip {
        let out = create_file(path, &tool.program).await?;
        let child = tool.spawn(Stdio::null(), out)?;
        wait_success(&tool.program, child).await?;
    } else {
        let out = create_file(path, "gzip").await?;
        let gzip_tool = ToolCommand::new("gzip").arg("-c");
        let mut compressor = gzip_tool.spawn(Stdio::piped(), out)?;
        let mut producer = tool.spawn(Stdio::null(), Stdio::piped())?;

        let mut source = producer
            .stdout
            .take()
            .ok_or_else(|| DbError::dump(&tool.program, "stdout not captured"))?;
        let mut sink = compressor
            .stdin
            .take()
            .ok_or_else(|| DbError::dump("gzip", "stdin not captured"))?;

        let pipe = async move {
            let copied = tokio::io::copy(&mut source, &mut sink).await;
            let _ = sink.shutdown().await;
            copied
        };
        let (copied, produced) = tokio::join!(pipe, wait_success(&tool.program, producer));
        produced?;
        copied.map_err(|e| DbError::dump("gzip", e.to_string()))?;
        wait_success("gzip", compressor).await?;
    }

    log_size(path).await;
    Ok(())
}

/// Feed `path` (optionally gzip-compressed) into `tool`'s stdin.
pub async fn restore_from_file(tool: &ToolCommand, path: &Path, gzip: bool) -> DbResult<()> {
    debug!(program = %tool.program, path = %path.display(), gzip, "Running restore tool");

    if !gzip {
        let input = open_file(path, &tool.program).await?;
        let child = tool.spawn(input, Stdio::null())?;
        return wait_success(&tool.program, child).await;
    }

    let gunzip_tool = ToolCommand::new("gunzip").arg("-c").arg(path.display().to_string());
    let mut decompressor = gunzip_tool.spawn(Stdio::null(), Stdio::piped())?;
    let mut consumer = tool.spawn(Stdio::piped(), Stdio::null())?;

    let mut source = decompressor
        .stdout
        .take()
        .ok_or_else(|| DbError::dump("gunzip", "stdout not captured"))?;
    let mut sink = consumer
        .stdin
        .take()
        .ok_or_else(|| DbError::dump(&tool.program, "stdin not captured"))?;

    let pipe = async move {
        let copied = tokio::io::copy(&mut source, &mut sink).await;
        let _ = sink.shutdown().await;
        copied
    };
    let (copied, decompressed) = tokio::join!(pipe, wait_success("gunzip", decompressor));
    decompressed?;
    copied.map_err(|e| DbError::dump(&tool.program, e.to_string()))?;
    wait_success(&tool.program, consumer).await
}

/// Run a tool that reads and writes its own files.
pub async fn run_tool(tool: &ToolCommand) -> DbResult<()> {
    debug!(program = %tool.program, "Running tool");
    let child = tool.spawn(Stdio::null(), Stdio::null())?;
    wait_success(&tool.program, child).await
}

/// Compress `plain` into `target` with gzip and remove `plain`.
pub async fn compress_file(plain: &Path, target: &Path) -> DbResult<()> {
    let tool = ToolCommand::new("gzip")
        .arg("-c")
        .arg(plain.display().to_string());
    dump_to_file(&tool, target, false).await?;
    tokio::fs::remove_file(plain)
        .await
        .map_err(|e| DbError::dump("gzip", e.to_string()))
}

/// Decompress `gz` into a sibling file and return its path.
pub async fn decompress_file(gz: &Path) -> DbResult<PathBuf> {
    let plain = gz.with_extension("");
    let tool = ToolCommand::new("gunzip")
        .arg("-c")
        .arg(gz.display().to_string());
    dump_to_file(&tool, &plain, false).await?;
    Ok(plain)
}

/// `path` with a trailing `.gz` removed.
pub fn strip_gz(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("gz") => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

async fn log_size(path: &Path) {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        info!(
            path = %path.display(),
            size = %humansize::format_size(meta.len(), humansize::DECIMAL),
            "Dump written"
        );
    }
}
