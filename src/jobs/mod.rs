pub mod execute;

use crate::jobs::execute::ExecuteJob;
use serde::{Deserialize, Serialize};

/// Worker job enum - represents the jobs the worker can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    /// Run one submission in the sandbox
    #[serde(rename = "execute")]
    Execute(ExecuteJob),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_job_parses() {
        let raw = r#"{"job_type":"execute","request_id":"a","result_key":"k","language":"c","code":"int main(){}","stdin":"1\n","client_ip":"10.0.0.7"}"#;
        let WorkerJob::Execute(job) = serde_json::from_str(raw).unwrap();
        assert_eq!(job.stdin.as_deref(), Some("1\n"));
        assert_eq!(job.client_ip.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_unknown_job_type_rejected() {
        let raw = r#"{"job_type":"judge","submission_id":1}"#;
        assert!(serde_json::from_str::<WorkerJob>(raw).is_err());
    }
}
