//! Descriptor provider backed by an external embedding program.
//!
//! The program receives encoded image bytes on stdin and prints one JSON
//! object on stdout:
//!
//! ```text
//! {"descriptor": [0.013, -0.092, ...]}   face found
//! {"descriptor": null}                   no face
//! ```
//!
//! A non-zero exit status or unparsable output is an extraction failure.

use std::process::Stdio;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::provider::{DescriptorProvider, ProviderError};
use crate::types::Descriptor;

#[derive(Debug, Deserialize)]
struct ProviderOutput {
    descriptor: Option<Vec<f32>>,
}

/// Runs `program args...` once per extraction.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    model_version: String,
}

impl CommandProvider {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            model_version: model_version.into(),
        }
    }

    /// Build from a `[program, arg...]` list. Returns `None` if empty.
    pub fn from_argv(argv: &[String], model_version: impl Into<String>) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec(), model_version))
    }

    fn parse_output(&self, stdout: &[u8]) -> Result<Descriptor, ProviderError> {
        let output: ProviderOutput = serde_json::from_slice(stdout).map_err(|e| {
            ProviderError::ExtractionFailed(format!("{}: malformed output: {e}", self.program))
        })?;
        match output.descriptor {
            Some(values) => Ok(Descriptor::new(values, self.model_version.clone())),
            None => Err(ProviderError::NoFaceDetected),
        }
    }
}

impl DescriptorProvider for CommandProvider {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn extract(&self, image: &[u8]) -> Result<Descriptor, ProviderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out extraction drops this future; take the child with it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::ExtractionFailed(format!("spawn {}: {e}", self.program)))?;

        // Feed stdin while stdout/stderr drain so neither pipe fills up.
        let stdin = child.stdin.take();
        let program = &self.program;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The program may exit before consuming all of stdin.
                if let Err(e) = stdin.write_all(image).await {
                    tracing::debug!(program = %program, error = %e, "provider closed stdin early");
                }
            }
        };

        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| ProviderError::ExtractionFailed(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::ExtractionFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        self.parse_output(&output.stdout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::provider::extract_with_timeout;
    use std::time::Duration;

    fn sh(script: &str) -> CommandProvider {
        CommandProvider::new("sh", vec!["-c".into(), script.into()], "test-v1")
    }

    #[tokio::test]
    async fn test_descriptor_parsed() {
        let provider = sh(r#"cat >/dev/null; echo '{"descriptor":[0.25,-0.5,1.0]}'"#);
        let d = provider.extract(b"fake image").await.unwrap();
        assert_eq!(d.values, vec![0.25, -0.5, 1.0]);
        assert_eq!(d.model_version, "test-v1");
    }

    #[tokio::test]
    async fn test_null_descriptor_is_no_face() {
        let provider = sh(r#"cat >/dev/null; echo '{"descriptor":null}'"#);
        let err = provider.extract(b"fake image").await.unwrap_err();
        assert_eq!(err, ProviderError::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let provider = sh("echo 'model missing' >&2; exit 3");
        let err = provider.extract(b"fake image").await.unwrap_err();
        match err {
            ProviderError::ExtractionFailed(msg) => assert!(msg.contains("model missing"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_output_is_failure() {
        let provider = sh("echo not-json");
        let err = provider.extract(b"fake image").await.unwrap_err();
        assert!(matches!(err, ProviderError::ExtractionFailed(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_failure() {
        let provider = CommandProvider::new("/nonexistent/rollcall-embed", vec![], "test-v1");
        let err = provider.extract(b"fake image").await.unwrap_err();
        assert!(matches!(err, ProviderError::ExtractionFailed(_)));
    }

    #[tokio::test]
    async fn test_slow_program_times_out() {
        let provider = sh("sleep 10");
        let err = extract_with_timeout(&provider, b"fake image", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ExtractionTimeout(_)));
    }

    #[tokio::test]
    async fn test_chatty_program_with_large_image() {
        // 200 KB of log output before stdin is read overflows the stderr pipe.
        let provider = sh(
            r#"head -c 200000 /dev/zero | tr '\0' x >&2; cat >/dev/null; echo '{"descriptor":[1.0]}'"#,
        );
        let image = vec![0xffu8; 1 << 20];
        let d = extract_with_timeout(&provider, &image, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(d.values, vec![1.0]);
    }

    #[test]
    fn test_from_argv() {
        assert!(CommandProvider::from_argv(&[], "v").is_none());
        let p = CommandProvider::from_argv(&["embed".into(), "--cpu".into()], "v").unwrap();
        assert_eq!(p.program, "embed");
        assert_eq!(p.args, vec!["--cpu".to_string()]);
    }
}
