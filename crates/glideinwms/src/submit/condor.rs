use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;
use classad::tools::{parse_json_ads, run_tool};
use classad::{Expression, quote_string};

use crate::credentials::CredentialType;
use crate::submit::{
    PilotRecord, RemoveMode, SubmitBackend, SubmitFuture, SubmitOutcome, SubmitRequest,
    SubmitResult,
};

/// Backend driving a schedd through `condor_submit`, `condor_q`, `condor_rm`,
/// `condor_release` and `condor_reconfig`.
#[derive(Debug, Clone)]
pub struct CondorSubmitBackend {
    /// Pilot startup script submitted as the executable.
    executable: PathBuf,
    /// Directory where submit description files are written.
    submit_dir: PathBuf,
    timeout: Duration,
}

impl CondorSubmitBackend {
    pub fn new(executable: PathBuf, submit_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            executable,
            submit_dir,
            timeout,
        }
    }
}

fn credential_lines(request: &SubmitRequest) -> Vec<String> {
    let files = &request.credential_files;
    let file = |index: usize| {
        files
            .get(index)
            .map(|path| path.display().to_string())
            .unwrap_or_default()
    };
    match request.credential_type {
        CredentialType::GridProxy => vec![format!("x509userproxy = {}", file(0))],
        CredentialType::KeyPair => vec![
            format!("ec2_access_key_id = {}", file(0)),
            format!("ec2_secret_access_key = {}", file(1)),
        ],
        CredentialType::Scitoken => vec![format!("scitokens_file = {}", file(0))],
        cred_type => cred_type
            .file_params()
            .iter()
            .enumerate()
            .map(|(index, param)| {
                format!("+Glidein{param}File = {}", quote_string(&file(index)))
            })
            .collect(),
    }
}

/// Builds the submit description of `request.count` pilots.
pub(super) fn create_submit_description(executable: &str, request: &SubmitRequest) -> String {
    let mut arguments = vec![
        format!("-factory {}", request.factory_name),
        format!("-name {}", request.glidein_name),
        format!("-entry {}", request.entry),
        format!("-clientname {}", request.client_name),
        format!("-schedd_cred {}", request.credential_id),
    ];
    for (name, value) in &request.params {
        arguments.push(format!("-param_{name} {}", value.replace(['"', '\''], "")));
    }

    let mut lines = vec![
        "universe = grid".to_string(),
        format!("grid_resource = {}", request.grid_resource),
        format!("executable = {executable}"),
        format!("arguments = \"{}\"", arguments.join(" ")),
        format!("request_cpus = {}", request.cores),
        "notification = Never".to_string(),
        "stream_output = False".to_string(),
        "stream_error = False".to_string(),
    ];
    for (name, value) in request.pilot_attributes() {
        lines.push(format!("+{name} = {}", quote_string(&value)));
    }
    lines.extend(credential_lines(request));
    for (name, value) in &request.submit_attrs {
        lines.push(format!("{name} = {value}"));
    }
    lines.push(format!("queue {}", request.count));
    let mut description = lines.join("\n");
    description.push('\n');
    description
}

/// Parses the `-terse` output of `condor_submit`, e.g. `123.0 - 123.4`.
pub(super) fn parse_terse_output(output: &str) -> SubmitResult<((u64, u64), u32)> {
    let parse_id = |id: &str| -> SubmitResult<(u64, u64)> {
        let (cluster, proc) = id
            .trim()
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Invalid job id `{id}`"))?;
        Ok((cluster.parse()?, proc.parse()?))
    };
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow::anyhow!("condor_submit printed no job ids"))?;
    let (first, last) = match line.split_once('-') {
        Some((first, last)) => (parse_id(first)?, parse_id(last)?),
        None => {
            let id = parse_id(line)?;
            (id, id)
        }
    };
    let count = if first.0 == last.0 {
        last.1.saturating_sub(first.1) + 1
    } else {
        // Several clusters are only reported by their first and last ids.
        1 + last.0 - first.0
    };
    Ok(((first.0, last.0), u32::try_from(count)?))
}

impl CondorSubmitBackend {
    async fn query(
        schedd: String,
        constraint: Expression,
        timeout: Duration,
    ) -> SubmitResult<Vec<PilotRecord>> {
        let output = run_tool(
            &["condor_q", "-name", &schedd, "-allusers", "-json"],
            timeout,
        )
        .await?;
        let ads = parse_json_ads(&output.stdout)?;
        Ok(ads
            .iter()
            .filter(|ad| constraint.matches(ad))
            .filter_map(PilotRecord::from_ad)
            .collect())
    }
}

impl SubmitBackend for CondorSubmitBackend {
    fn enum_pilots(&self, schedd: &str, constraint: &Expression) -> SubmitFuture<Vec<PilotRecord>> {
        Box::pin(Self::query(
            schedd.to_string(),
            constraint.clone(),
            self.timeout,
        ))
    }

    fn submit(&self, schedd: &str, request: &SubmitRequest) -> SubmitFuture<SubmitOutcome> {
        let schedd = schedd.to_string();
        let description =
            create_submit_description(&self.executable.display().to_string(), request);
        let submit_dir = self.submit_dir.clone();
        let timeout = self.timeout;
        let count = request.count;

        Box::pin(async move {
            if count == 0 {
                return Ok(SubmitOutcome::nothing());
            }
            std::fs::create_dir_all(&submit_dir)
                .with_context(|| format!("Cannot create {}", submit_dir.display()))?;
            let mut file = tempfile::Builder::new()
                .prefix("pilot-")
                .suffix(".sub")
                .tempfile_in(&submit_dir)?;
            file.write_all(description.as_bytes())?;
            file.flush()?;
            let path = file.path().display().to_string();

            match run_tool(
                &["condor_submit", "-terse", "-name", &schedd, &path],
                timeout,
            )
            .await
            {
                Ok(output) => {
                    let stdout = output
                        .stdout
                        .to_str()
                        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 condor_submit output: {e:?}"))?;
                    let (cluster_range, submitted) = parse_terse_output(stdout)?;
                    Ok(SubmitOutcome {
                        cluster_range: Some(cluster_range),
                        submitted: submitted.min(count),
                        error: None,
                    })
                }
                Err(error) => Ok(SubmitOutcome {
                    cluster_range: None,
                    submitted: 0,
                    error: Some(format!("{error:?}")),
                }),
            }
        })
    }

    fn remove(&self, schedd: &str, constraint: &Expression, mode: RemoveMode) -> SubmitFuture<u32> {
        let schedd = schedd.to_string();
        let constraint = constraint.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let affected = Self::query(schedd.clone(), constraint.clone(), timeout).await?;
            if affected.is_empty() {
                return Ok(0);
            }
            let source = constraint.source().to_string();
            let mut arguments = match mode {
                RemoveMode::Graceful => vec!["condor_rm"],
                RemoveMode::Immediate => vec!["condor_rm", "-forcex"],
                RemoveMode::Hold => vec!["condor_hold"],
            };
            arguments.extend(["-name", schedd.as_str(), "-constraint", source.as_str()]);
            run_tool(&arguments, timeout).await?;
            Ok(u32::try_from(affected.len())?)
        })
    }

    fn release(&self, schedd: &str, constraint: &Expression) -> SubmitFuture<u32> {
        let schedd = schedd.to_string();
        let constraint = constraint.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let affected = Self::query(schedd.clone(), constraint.clone(), timeout).await?;
            if affected.is_empty() {
                return Ok(0);
            }
            run_tool(
                &[
                    "condor_release",
                    "-name",
                    &schedd,
                    "-constraint",
                    constraint.source(),
                ],
                timeout,
            )
            .await?;
            Ok(u32::try_from(affected.len())?)
        })
    }

    fn reconfigure(&self, schedd: &str) -> SubmitFuture<()> {
        let schedd = schedd.to_string();
        let timeout = self.timeout;
        Box::pin(async move {
            run_tool(&["condor_reconfig", "-schedd", "-name", &schedd], timeout).await?;
            Ok(())
        })
    }
}
