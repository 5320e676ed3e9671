//! Bootstrap-completion gate
//!
//! A freshly provisioned database node writes a scan report while it streams
//! data from its peers. The report is a JSON array of per-keyspace entries:
//!
//! ```json
//! [{"bootstrapped": "IN_PROGRESS"}, {"bootstrapped": "COMPLETED"}]
//! ```
//!
//! The node counts as bootstrapped once any entry reports `COMPLETED`. The
//! gate is read-only and never retries; callers such as readiness probes
//! poll it.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::Error;

/// Value of `bootstrapped` once a keyspace has finished streaming
pub const BOOTSTRAP_COMPLETED: &str = "COMPLETED";

/// One report entry; fields other than `bootstrapped` are ignored
#[derive(Debug, Deserialize)]
struct ReportEntry {
    #[serde(default)]
    bootstrapped: Option<String>,
}

/// Decide from report text whether bootstrap completed
///
/// Entries with a missing or unrecognized `bootstrapped` value count as not
/// completed. Anything other than a JSON array of objects is an error.
pub fn parse_report(contents: &str) -> Result<bool, Error> {
    decode(contents, "parsing bootstrap report").map(|entries| completed(&entries))
}

/// Read the report at `path` and decide whether bootstrap completed
pub async fn is_bootstrapped(path: impl AsRef<Path>) -> Result<bool, Error> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(format!("reading bootstrap report {}", path.display()), e))?;

    let entries = decode(
        &contents,
        &format!("parsing bootstrap report {}", path.display()),
    )?;
    let done = completed(&entries);
    debug!(path = %path.display(), entries = entries.len(), bootstrapped = done, "read bootstrap report");
    Ok(done)
}

fn decode(contents: &str, context: &str) -> Result<Vec<ReportEntry>, Error> {
    serde_json::from_str(contents).map_err(|e| Error::serialization(context, e))
}

fn completed(entries: &[ReportEntry]) -> bool {
    entries
        .iter()
        .any(|e| e.bootstrapped.as_deref() == Some(BOOTSTRAP_COMPLETED))
}
