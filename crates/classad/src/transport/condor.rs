use bstr::ByteSlice;
use std::io::Write;
use std::time::Duration;

use crate::ad::{ClassAd, quote_string};
use crate::tools::{parse_json_ads, run_tool};
use crate::transport::{Query, QuerySource, Transport, TransportError, TransportFuture};

/// Transport backed by `condor_status`, `condor_q` and `condor_advertise`.
///
/// Constraints are evaluated locally by the expression engine after fetching all ads of the
/// requested type, so that the full expression language is available in queries.
#[derive(Debug, Clone)]
pub struct CondorTransport {
    timeout: Duration,
}

impl CondorTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn classify_failure(error: anyhow::Error) -> TransportError {
    let message = format!("{error:?}");
    let lowercase = message.to_lowercase();
    if lowercase.contains("did not finish within") {
        TransportError::Timeout(message)
    } else if lowercase.contains("permission denied")
        || lowercase.contains("authenticat")
        || lowercase.contains("not authorized")
    {
        TransportError::AuthDenied(message)
    } else {
        TransportError::Unreachable(message)
    }
}

/// Writes an ad in long form into a temporary file for `condor_advertise`.
fn write_ad_file(content: &str) -> Result<tempfile::NamedTempFile, TransportError> {
    let mut file = tempfile::Builder::new().prefix("gwms-ad-").tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

async fn condor_advertise(
    pool: String,
    command: &'static str,
    content: String,
    timeout: Duration,
) -> Result<(), TransportError> {
    let file = write_ad_file(&content)?;
    let path = file.path().display().to_string();
    let mut arguments = vec!["condor_advertise"];
    if !pool.is_empty() {
        arguments.extend(["-pool", pool.as_str()]);
    }
    arguments.extend([command, path.as_str()]);
    let output = run_tool(&arguments, timeout)
        .await
        .map_err(classify_failure)?;
    // condor_advertise reports rejected updates on stderr while still exiting with 0
    let stderr = output.stderr.to_str_lossy();
    if stderr.to_lowercase().contains("failed to send") {
        return Err(TransportError::Unreachable(stderr.trim().to_string()));
    }
    Ok(())
}

impl Transport for CondorTransport {
    fn query(&self, pool: &str, query: &Query) -> TransportFuture<Vec<ClassAd>> {
        let pool = pool.to_string();
        let query = query.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let type_constraint = format!("MyType == {}", quote_string(&query.my_type));
            let mut arguments = match &query.source {
                QuerySource::Collector => vec!["condor_status", "-any", "-json"],
                QuerySource::Schedd(schedd) => {
                    vec!["condor_q", "-allusers", "-json", "-name", schedd.as_str()]
                }
            };
            if !pool.is_empty() {
                arguments.extend(["-pool", pool.as_str()]);
            }
            if query.source == QuerySource::Collector {
                arguments.extend(["-constraint", type_constraint.as_str()]);
            }
            let output = run_tool(&arguments, timeout)
                .await
                .map_err(classify_failure)?;
            let ads = parse_json_ads(&output.stdout)?;
            Ok(query.apply(ads))
        })
    }

    fn advertise(&self, pool: &str, ad: &ClassAd) -> TransportFuture<()> {
        Box::pin(condor_advertise(
            pool.to_string(),
            "UPDATE_AD_GENERIC",
            ad.to_long_form(),
            self.timeout,
        ))
    }

    fn invalidate(&self, pool: &str, my_type: &str, name: &str) -> TransportFuture<()> {
        // The requirements must be an expression, which the typed ad cannot carry.
        let content = format!(
            "MyType = \"Query\"\nTargetType = {}\nRequirements = Name == {}\n",
            quote_string(my_type),
            quote_string(name)
        );
        Box::pin(condor_advertise(
            pool.to_string(),
            "INVALIDATE_ADS_GENERIC",
            content,
            self.timeout,
        ))
    }
}
