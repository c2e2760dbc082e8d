//! Subprocess runner, grounded on `original_source/ats/kyaraben/process.py`.
//! Always `exec`s an argv, never a shell string, so caller-supplied
//! arguments cannot inject shell syntax.

use crate::errors::{DriverError, DriverResult};
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

fn crlf_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\r\n|\r").unwrap())
}

/// Captured process output with CRLF normalisation and optional trailing
/// whitespace trim, mirroring `ProcWrap` in the original.
pub struct ProcWrap {
    pub returncode: Option<i32>,
    out: String,
    err: String,
}

impl ProcWrap {
    fn to_str(bytes: &[u8], strip: bool) -> String {
        let text = String::from_utf8_lossy(bytes);
        let normalised = crlf_re().replace_all(&text, "\n");
        if strip {
            normalised.trim_end().to_string()
        } else {
            normalised.into_owned()
        }
    }

    pub fn stdout(&self) -> &str {
        &self.out
    }

    pub fn stderr(&self) -> &str {
        &self.err
    }

    pub fn out_lines(&self) -> Vec<&str> {
        self.out.split('\n').collect()
    }
}

/// Quotes argv for logging only; never used to build a shell command line.
pub fn quoted_cmdline(args: &[&str]) -> String {
    args.iter()
        .map(|a| {
            if a.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c)) {
                a.to_string()
            } else {
                format!("'{}'", a.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Default)]
pub struct RunOptions<'a> {
    pub stdin_bytes: Option<&'a [u8]>,
    pub strip: bool,
    pub ignore_errors: bool,
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<&'a std::path::Path>,
}

pub async fn aiorun(args: &[&str], opts: RunOptions<'_>) -> DriverResult<ProcWrap> {
    let (program, rest) = args.split_first().expect("aiorun requires at least a program name");
    let mut cmd = Command::new(program);
    cmd.args(rest);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    if let Some(env) = &opts.env {
        cmd.env_clear();
        cmd.envs(env);
    }
    if let Some(cwd) = opts.cwd {
        cmd.current_dir(cwd);
    }

    tracing::info!(command = %quoted_cmdline(args), "running subprocess");

    let mut child = cmd.spawn().map_err(|e| {
        DriverError::Process(args.iter().map(|s| s.to_string()).collect(), None, e.to_string())
    })?;

    if let Some(bytes) = opts.stdin_bytes {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(bytes).await;
        }
    }
    drop(child.stdin.take());

    let output = child.wait_with_output().await.map_err(|e| {
        DriverError::Process(args.iter().map(|s| s.to_string()).collect(), None, e.to_string())
    })?;

    let wrapped = ProcWrap {
        returncode: output.status.code(),
        out: ProcWrap::to_str(&output.stdout, opts.strip),
        err: ProcWrap::to_str(&output.stderr, opts.strip),
    };

    if !opts.ignore_errors && output.status.code() != Some(0) {
        return Err(DriverError::Process(
            args.iter().map(|s| s.to_string()).collect(),
            wrapped.returncode,
            wrapped.err.clone(),
        ));
    }

    Ok(wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_normalises_lone_cr() {
        let out = ProcWrap::to_str(b"a\rb", false);
        assert_eq!(out, "a\nb");
    }

    #[test]
    fn crlf_normalises_crlf() {
        let out = ProcWrap::to_str(b"a\r\nb", false);
        assert_eq!(out, "a\nb");
    }

    #[test]
    fn crlf_then_lone_cr_yields_blank_line() {
        let out = ProcWrap::to_str(b"a\n\rb", false);
        assert_eq!(out, "a\n\nb");
        let wrap = ProcWrap { returncode: Some(0), out, err: String::new() };
        assert_eq!(wrap.out_lines(), vec!["a", "", "b"]);
    }

    #[tokio::test]
    async fn echo_roundtrips_stdout_after_strip() {
        let result = aiorun(&["echo", "hello"], RunOptions { strip: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(result.stdout(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_raises_unless_ignored() {
        let result = aiorun(&["false"], RunOptions::default()).await;
        assert!(result.is_err());
        let result =
            aiorun(&["false"], RunOptions { ignore_errors: true, ..Default::default() }).await;
        assert!(result.is_ok());
    }
}
