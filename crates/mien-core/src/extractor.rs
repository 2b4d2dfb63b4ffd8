//! Boundary to the face-embedding provider.
//!
//! The core never decodes images. A provider turns image bytes into zero or
//! more descriptors; the core keeps only the first one.

use crate::error::EngineError;
use crate::types::Descriptor;
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Default wall-clock limit for one [`CommandExtractor`] run.
pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Turns an encoded image into face descriptors, in provider-defined order.
///
/// Shared between concurrent callers, so implementations take `&self`.
pub trait Extractor: Send + Sync {
    /// Zero descriptors means no face was found; that is not an error here.
    fn extract(&self, image: &[u8]) -> Result<Vec<Descriptor>, EngineError>;
}

/// Apply the single-face policy: no descriptor is `NoFaceDetected`,
/// several means the first one wins.
pub fn first_face(descriptors: Vec<Descriptor>) -> Result<Descriptor, EngineError> {
    let count = descriptors.len();
    let first = descriptors
        .into_iter()
        .next()
        .ok_or(EngineError::NoFaceDetected)?;
    if count > 1 {
        tracing::debug!(faces = count, "multiple faces detected; using the first");
    }
    Ok(first)
}

/// Extract and apply [`first_face`] in one call.
pub fn extract_first(extractor: &dyn Extractor, image: &[u8]) -> Result<Descriptor, EngineError> {
    if image.is_empty() {
        return Err(EngineError::ExtractionFailure("image is empty".into()));
    }
    first_face(extractor.extract(image)?)
}

/// JSON document printed by an embedding program.
#[derive(Debug, Deserialize)]
struct ExtractorOutput {
    #[serde(default)]
    descriptors: Vec<Vec<f32>>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse `{"descriptors": [[f32, ...], ...]}` as printed by an embedding program.
///
/// An `"error"` field, or any descriptor that is empty or non-finite, is an
/// `ExtractionFailure`.
pub fn parse_descriptors(json: &[u8]) -> Result<Vec<Descriptor>, EngineError> {
    let output: ExtractorOutput = serde_json::from_slice(json)
        .map_err(|e| EngineError::ExtractionFailure(format!("malformed provider output: {e}")))?;

    if let Some(message) = output.error {
        return Err(EngineError::ExtractionFailure(message));
    }

    output
        .descriptors
        .into_iter()
        .enumerate()
        .map(|(i, values)| {
            Descriptor::new(values).map_err(|e| {
                EngineError::ExtractionFailure(format!("descriptor {i} from provider: {e}"))
            })
        })
        .collect()
}

/// Runs an external embedding program once per image.
///
/// The image is written to the program's stdin; the program prints the JSON
/// accepted by [`parse_descriptors`] on stdout and exits with status 0.
/// A program still running after the timeout is killed and the run is an
/// `ExtractionFailure`. Only the direct child is killed, so wrapper scripts
/// should `exec` the real provider.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_EXTRACT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Wait for `child` until `deadline`, killing it once the deadline passes.
///
/// `None` means the child was killed.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            // Fails only if the child already exited; reap it either way.
            if let Err(err) = child.kill() {
                tracing::debug!(error = %err, "kill after deadline failed");
            }
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn read_all(mut pipe: impl Read) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)?;
    Ok(buf)
}

impl Extractor for CommandExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<Descriptor>, EngineError> {
        let deadline = Instant::now() + self.timeout;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::ExtractionFailure(format!(
                    "failed to start {}: {e}",
                    self.program.display()
                ))
            })?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(mut stdin), Some(stdout), Some(stderr)) = pipes else {
            // Reap the child before reporting; the pipes were requested above.
            let _ = wait_until(&mut child, Instant::now());
            return Err(EngineError::ExtractionFailure("provider pipes unavailable".into()));
        };

        // Providers may fill stdout before draining stdin, so every pipe gets
        // its own thread while this one watches the deadline.
        let (status, stdout, stderr, written) = std::thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(image));
            let out_reader = s.spawn(move || read_all(stdout));
            let err_reader = s.spawn(move || read_all(stderr));
            let status = wait_until(&mut child, deadline);
            (status, out_reader.join(), err_reader.join(), writer.join())
        });

        let io_failure =
            |e: std::io::Error| EngineError::ExtractionFailure(format!("provider I/O: {e}"));
        let joined = |r: std::thread::Result<std::io::Result<Vec<u8>>>| {
            r.unwrap_or_else(|_| Err(std::io::Error::other("pipe reader panicked")))
        };

        let Some(status) = status.map_err(io_failure)? else {
            tracing::warn!(
                program = %self.program.display(),
                timeout = ?self.timeout,
                "provider killed after deadline"
            );
            return Err(EngineError::ExtractionFailure(format!(
                "{} timed out after {:?}",
                self.program.display(),
                self.timeout
            )));
        };
        let stdout = joined(stdout).map_err(io_failure)?;
        let stderr = joined(stderr).map_err(io_failure)?;

        if let Ok(Err(err)) = written {
            tracing::debug!(error = %err, "provider closed stdin early");
        }

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(EngineError::ExtractionFailure(format!(
                "{} exited with {}: {}",
                self.program.display(),
                status,
                stderr.trim()
            )));
        }

        let descriptors = parse_descriptors(&stdout)?;
        tracing::debug!(
            program = %self.program.display(),
            faces = descriptors.len(),
            "provider returned descriptors"
        );
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedExtractor(Vec<Vec<f32>>);

    impl Extractor for FixedExtractor {
        fn extract(&self, _image: &[u8]) -> Result<Vec<Descriptor>, EngineError> {
            self.0.iter().cloned().map(Descriptor::new).collect()
        }
    }

    #[test]
    fn test_first_face_none() {
        assert_eq!(first_face(vec![]), Err(EngineError::NoFaceDetected));
    }

    #[test]
    fn test_first_face_picks_first() {
        let faces = vec![
            Descriptor::new(vec![1.0, 2.0]).unwrap(),
            Descriptor::new(vec![3.0, 4.0]).unwrap(),
        ];
        assert_eq!(first_face(faces).unwrap().values(), &[1.0f32, 2.0]);
    }

    #[test]
    fn test_extract_first_no_face() {
        let extractor = FixedExtractor(vec![]);
        assert_eq!(
            extract_first(&extractor, b"jpeg"),
            Err(EngineError::NoFaceDetected)
        );
    }

    #[test]
    fn test_extract_first_empty_image() {
        let extractor = FixedExtractor(vec![vec![1.0]]);
        assert!(matches!(
            extract_first(&extractor, b""),
            Err(EngineError::ExtractionFailure(_))
        ));
    }

    #[test]
    fn test_parse_descriptors() {
        let parsed = parse_descriptors(br#"{"descriptors": [[0.5, -0.25], [1, 2]]}"#).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].values(), &[1.0f32, 2.0]);

        assert!(parse_descriptors(br#"{"descriptors": []}"#).unwrap().is_empty());
        assert!(parse_descriptors(br#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_descriptors_failures() {
        assert!(matches!(
            parse_descriptors(b"not json"),
            Err(EngineError::ExtractionFailure(_))
        ));
        assert_eq!(
            parse_descriptors(br#"{"error": "corrupt image"}"#),
            Err(EngineError::ExtractionFailure("corrupt image".into()))
        );
        assert!(matches!(
            parse_descriptors(br#"{"descriptors": [[]]}"#),
            Err(EngineError::ExtractionFailure(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_extractor_reads_stdout() {
        let extractor = CommandExtractor::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; echo '{"descriptors": [[0.1, 0.2, 0.3]]}'"#.into(),
            ],
        );
        let faces = extractor.extract(&[0u8; 64 * 1024]).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].dimension(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_extractor_non_zero_exit() {
        let extractor = CommandExtractor::new(
            "sh",
            vec!["-c".into(), "echo 'cannot decode' >&2; exit 3".into()],
        );
        match extractor.extract(b"garbage") {
            Err(EngineError::ExtractionFailure(msg)) => assert!(msg.contains("cannot decode")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_extractor_kills_after_deadline() {
        let extractor = CommandExtractor::new("sh", vec!["-c".into(), "exec sleep 30".into()])
            .with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        match extractor.extract(b"image") {
            Err(EngineError::ExtractionFailure(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_extractor_usable_after_timeout() {
        // Sleeps only when the image asks for it.
        let extractor = CommandExtractor::new(
            "sh",
            vec![
                "-c".into(),
                r#"if [ "$(cat)" = slow ]; then exec sleep 30; fi; echo '{"descriptors": [[0.5]]}'"#
                    .into(),
            ],
        )
        .with_timeout(Duration::from_millis(300));

        assert!(matches!(
            extractor.extract(b"slow"),
            Err(EngineError::ExtractionFailure(_))
        ));
        let faces = extractor.extract(b"fast").unwrap();
        assert_eq!(faces[0].values(), &[0.5f32]);
    }

    #[test]
    fn test_command_extractor_missing_program() {
        let extractor = CommandExtractor::new("/nonexistent/mien-extract", vec![]);
        assert!(matches!(
            extractor.extract(b"image"),
            Err(EngineError::ExtractionFailure(_))
        ));
    }
}
