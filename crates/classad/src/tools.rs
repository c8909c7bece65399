//! Invocation of the HTCondor command line tools.
use anyhow::Context;
use bstr::ByteSlice;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use crate::ad::ClassAd;
use crate::transport::TransportError;

pub fn create_command(arguments: &[&str], workdir: Option<&Path>) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    if let Some(workdir) = workdir {
        command.current_dir(workdir);
    }
    // Dropping the future (deadline, shutdown) must not leave the tool running.
    command.kill_on_drop(true);
    command
}

pub fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs a tool to completion within `timeout` and returns its successful output.
pub async fn run_tool(arguments: &[&str], timeout: Duration) -> anyhow::Result<Output> {
    log::debug!("Running command `{}`", arguments.join(" "));
    let mut command = create_command(arguments, None);
    let program = arguments[0];
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| anyhow::anyhow!("{program} did not finish within {timeout:?}"))?
        .with_context(|| format!("{program} start failed"))?;
    log::trace!(
        "{program} output\nStdout\n{}Stderr\n{}",
        output.stdout.to_str_lossy(),
        output.stderr.to_str_lossy()
    );
    check_command_output(output).with_context(|| format!("{program} execution failed"))
}

/// Parses the `-json` output of `condor_status`/`condor_q`. No matching ads prints nothing.
pub fn parse_json_ads(stdout: &[u8]) -> Result<Vec<ClassAd>, TransportError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let data: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|error| TransportError::InvalidAd(format!("Cannot parse JSON output: {error}")))?;
    let items = data
        .as_array()
        .ok_or_else(|| TransportError::InvalidAd("JSON output is not an array".to_string()))?;
    items.iter().map(ClassAd::from_json).collect()
}
