//! Local process device provider.
//!
//! Each device is a virtual slot on this machine. Executing a batch runs
//! the configured command as a child process and reads verdicts from its
//! output, one per line:
//!
//! ```text
//! PASSED com.example.LoginTest#valid
//! FAILED com.example.LoginTest#invalid: expected 401 but was 500
//! IGNORED com.example.LoginTest#legacy
//! ASSUMPTION com.example.LoginTest#onlyOnCi: not on CI
//! ```
//!
//! Any other line is logged at debug level. Tests the command never
//! reports come back as uncompleted, and so does the whole batch when the
//! process stays silent for longer than `test_output_timeout_millis`.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem and network) |
//! | Device attributes | `model` from config, host OS |
//! | Hot plug | No, all devices connect up front |
//!
//! # Example Configuration
//!
//! ```toml
//! [devices]
//! type = "local"
//! count = 4
//! command = "./gradlew connectedCheck --tests {tests}"
//! working_dir = "/path/to/project"
//!
//! [devices.env]
//! ANDROID_SERIAL = "emulator-5554"
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

use super::{Command, DeviceEventStream, DeviceProvider, DeviceProviderEvent, ProviderResult};
use crate::config::LocalDevicesConfig;
use crate::model::{
    Device, DeviceError, DeviceInfo, DeviceResult, Test, TestBatch, TestResult, TestStatus,
};

/// Provider that announces `count` local devices and then ends its stream.
pub struct LocalDeviceProvider {
    config: LocalDevicesConfig,
    output_timeout: Duration,
    subscribed: bool,
}

impl LocalDeviceProvider {
    pub fn new(config: LocalDevicesConfig, output_timeout: Duration) -> Self {
        Self {
            config,
            output_timeout,
            subscribed: false,
        }
    }
}

#[async_trait]
impl DeviceProvider for LocalDeviceProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn subscribe(&mut self) -> ProviderResult<DeviceEventStream> {
        if self.subscribed {
            return Err(super::ProviderError::AlreadySubscribed);
        }
        self.subscribed = true;

        info!("Starting {} local device(s)", self.config.count);
        let devices: Vec<DeviceProviderEvent> = (0..self.config.count)
            .map(|index| {
                let device = LocalDevice::new(index, &self.config, self.output_timeout);
                DeviceProviderEvent::Connected(Box::new(device))
            })
            .collect();
        Ok(Box::pin(stream::iter(devices)))
    }

    async fn terminate(&mut self) {
        debug!("Local device provider terminated");
    }
}

/// A device that runs each batch as a local child process.
pub struct LocalDevice {
    info: DeviceInfo,
    command: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    output_timeout: Duration,
}

impl LocalDevice {
    pub fn new(index: usize, config: &LocalDevicesConfig, output_timeout: Duration) -> Self {
        let info = DeviceInfo::new(format!("local-{}", index))
            .with_model(config.model.clone())
            .with_operating_system(std::env::consts::OS);
        let mut env: Vec<(String, String)> =
            config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.sort();
        env.push(("FLEETRUN_DEVICE_SERIAL".to_string(), info.serial_number.clone()));

        Self {
            info,
            command: config.command.clone(),
            working_dir: config.working_dir.clone(),
            env,
            output_timeout,
        }
    }

    fn build_command(&self, batch: &TestBatch) -> DeviceResult<Command> {
        let ids: Vec<String> = batch.tests.iter().map(ToString::to_string).collect();
        let mut cmd = Command::from_template(&self.command, &ids)
            .map_err(|e| DeviceError::ExecFailed(e.to_string()))?;
        if let Some(dir) = &self.working_dir {
            cmd = cmd.working_dir(dir.to_string_lossy());
        }
        for (key, value) in &self.env {
            cmd = cmd.env(key, value);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl Device for LocalDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn prepare(&mut self) -> DeviceResult<()> {
        if let Some(dir) = &self.working_dir
            && !dir.is_dir()
        {
            return Err(DeviceError::PrepareFailed(format!(
                "Working directory {} does not exist",
                dir.display()
            )));
        }
        Ok(())
    }

    async fn execute(&mut self, batch: &TestBatch) -> DeviceResult<Vec<TestResult>> {
        let cmd = self.build_command(batch)?;
        debug!("[{}] Running: {}", self.info.serial_number, cmd.to_shell_string());

        let mut process = tokio::process::Command::new(&cmd.program);
        process.args(&cmd.args);
        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| DeviceError::ExecFailed(format!("{}: {}", cmd.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::ExecFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeviceError::ExecFailed("stderr not captured".to_string()))?;

        let stdout_stream = LinesStream::new(BufReader::new(stdout).lines()).map(OutputLine::Stdout);
        let stderr_stream = LinesStream::new(BufReader::new(stderr).lines()).map(OutputLine::Stderr);
        let mut output = stream::select(stdout_stream, stderr_stream);

        let mut results = Vec::new();
        let mut last_verdict = Utc::now();
        loop {
            let line = match tokio::time::timeout(self.output_timeout, output.next()).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => {
                    return Err(DeviceError::Timeout(format!(
                        "no output for {:?} from batch {}",
                        self.output_timeout, batch.id
                    )));
                }
            };
            match line {
                OutputLine::Stdout(Ok(line)) => match parse_verdict(&line, batch) {
                    Some(verdict) => {
                        let now = Utc::now();
                        let mut result =
                            TestResult::new(verdict.test, self.info.clone(), verdict.status, &batch.id)
                                .with_times(last_verdict, now);
                        if let Some(message) = verdict.message {
                            result = result.with_stacktrace(message);
                        }
                        last_verdict = now;
                        results.push(result);
                    }
                    None => debug!("[{}] {}", self.info.serial_number, line),
                },
                OutputLine::Stderr(Ok(line)) => debug!("[{}] stderr: {}", self.info.serial_number, line),
                OutputLine::Stdout(Err(e)) | OutputLine::Stderr(Err(e)) => {
                    warn!("[{}] Failed to read output: {}", self.info.serial_number, e);
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            debug!(
                "[{}] Batch {} exited with {}",
                self.info.serial_number, batch.id, status
            );
        }
        Ok(results)
    }

    async fn dispose(&mut self) {
        debug!("[{}] Disposed", self.info.serial_number);
    }
}

enum OutputLine {
    Stdout(std::io::Result<String>),
    Stderr(std::io::Result<String>),
}

#[derive(Debug, PartialEq, Eq)]
struct Verdict {
    test: Test,
    status: TestStatus,
    message: Option<String>,
}

/// Parses `STATUS package.Class#method[: message]`.
///
/// Returns `None` for lines that are not verdicts or name a test outside
/// the batch. The batch's own [`Test`] is returned so meta properties
/// survive the round trip.
fn parse_verdict(line: &str, batch: &TestBatch) -> Option<Verdict> {
    let (keyword, rest) = line.trim().split_once(' ')?;
    let status = match keyword {
        "PASSED" => TestStatus::Passed,
        "FAILED" => TestStatus::Failure,
        "IGNORED" => TestStatus::Ignored,
        "ASSUMPTION" => TestStatus::AssumptionFailure,
        _ => return None,
    };
    let (id, message) = match rest.split_once(": ") {
        Some((id, message)) => (id, Some(message.trim().to_string())),
        None => (rest, None),
    };
    let parsed = Test::parse(id, batch.component.clone())?;
    let test = batch.tests.iter().find(|t| **t == parsed)?.clone();
    Some(Verdict {
        test,
        status,
        message: message.filter(|m| !m.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ComponentInfo;

    fn test(method: &str) -> Test {
        Test::new("com.example", "LoginTest", method, ComponentInfo::default())
    }

    fn batch(methods: &[&str]) -> TestBatch {
        TestBatch::from_tests(methods.iter().map(|m| test(m)).collect()).unwrap()
    }

    fn device(command: &str, output_timeout: Duration) -> LocalDevice {
        let config = LocalDevicesConfig {
            command: command.to_string(),
            ..Default::default()
        };
        LocalDevice::new(0, &config, output_timeout)
    }

    #[test]
    fn test_parse_verdicts() {
        let batch = batch(&["valid", "invalid"]);

        let passed = parse_verdict("PASSED com.example.LoginTest#valid", &batch).unwrap();
        assert_eq!(passed.status, TestStatus::Passed);
        assert_eq!(passed.test, test("valid"));
        assert_eq!(passed.message, None);

        let failed =
            parse_verdict("FAILED com.example.LoginTest#invalid: expected 401", &batch).unwrap();
        assert_eq!(failed.status, TestStatus::Failure);
        assert_eq!(failed.message.as_deref(), Some("expected 401"));
    }

    #[test]
    fn test_parse_rejects_noise_and_foreign_tests() {
        let batch = batch(&["valid"]);
        assert!(parse_verdict("> Task :app:connectedCheck", &batch).is_none());
        assert!(parse_verdict("PASSED", &batch).is_none());
        assert!(parse_verdict("PASSED com.example.LoginTest#other", &batch).is_none());
        assert!(parse_verdict("SKIPPED com.example.LoginTest#valid", &batch).is_none());
    }

    #[tokio::test]
    async fn test_provider_announces_configured_devices() {
        let config = LocalDevicesConfig {
            count: 3,
            model: "pixel".to_string(),
            ..Default::default()
        };
        let mut provider = LocalDeviceProvider::new(config, Duration::from_secs(1));
        let events: Vec<_> = provider.subscribe().await.unwrap().collect().await;

        let serials: Vec<String> = events
            .iter()
            .map(|e| match e {
                DeviceProviderEvent::Connected(d) => d.serial_number(),
                DeviceProviderEvent::Disconnected(i) => i.serial_number.clone(),
            })
            .collect();
        assert_eq!(serials, vec!["local-0", "local-1", "local-2"]);
        assert!(provider.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn test_execute_reads_verdicts_from_stdout() {
        let mut device = device(
            r#"sh -c 'for t in "$@"; do echo "PASSED $t"; done; echo "FAILED com.example.LoginTest#b: boom"' sh {tests}"#,
            Duration::from_secs(10),
        );
        let batch = batch(&["a", "b", "c"]);

        let results = device.execute(&batch).await.unwrap();

        assert_eq!(results.len(), 4);
        let b: Vec<_> = results.iter().filter(|r| r.test == test("b")).collect();
        assert_eq!(b[0].status, TestStatus::Passed);
        assert_eq!(b[1].status, TestStatus::Failure);
        assert_eq!(b[1].stacktrace.as_deref(), Some("boom"));
        assert!(results.iter().all(|r| r.batch_id == batch.id));
    }

    #[tokio::test]
    async fn test_execute_silent_process_times_out() {
        let mut device = device("sleep 5", Duration::from_millis(100));
        let err = device.execute(&batch(&["a"])).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_execute_missing_program_fails() {
        let mut device = device("/nonexistent/fleetrun-runner {tests}", Duration::from_secs(1));
        let err = device.execute(&batch(&["a"])).await.unwrap_err();
        assert!(matches!(err, DeviceError::ExecFailed(_)));
    }

    #[tokio::test]
    async fn test_prepare_checks_working_dir() {
        let config = LocalDevicesConfig {
            working_dir: Some(PathBuf::from("/nonexistent/fleetrun")),
            ..Default::default()
        };
        let mut device = LocalDevice::new(0, &config, Duration::from_secs(1));
        assert!(matches!(
            device.prepare().await,
            Err(DeviceError::PrepareFailed(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let config = LocalDevicesConfig {
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let mut device = LocalDevice::new(1, &config, Duration::from_secs(1));
        assert!(device.prepare().await.is_ok());
        assert_eq!(device.info().serial_number, "local-1");
    }
}
