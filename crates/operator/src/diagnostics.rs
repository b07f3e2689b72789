use k8s_openapi::chrono::{DateTime, Utc};
use kube::{
    Client,
    runtime::events::{Recorder, Reporter},
};
use serde::Serialize;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    /// Last successful reconcile event
    pub last_event: DateTime<Utc>,
    /// Number of policies written since start
    pub policy_writes: u64,
    /// Number of failed reconciliations since start
    pub reconcile_failures: u64,
    /// Kubernetes event reporter
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            policy_writes: 0,
            reconcile_failures: 0,
            reporter: "policyward".into(),
        }
    }
}

impl Diagnostics {
    /// Creates a new recorder wrapper around self
    #[must_use]
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}
