//! Urban cooling model adapter: runs an external command per scenario on a
//! scratch LULC GeoTIFF and reads back the simulated air temperature raster.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use greening_core::config::UcmInputs;
use greening_core::raster::LulcRaster;
use greening_core::temperature::{ModelError, TemperatureModel};

use crate::raster_io;

/// Last lines of the command's stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 5;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Invokes `program [prefix_args] --lulc .. --biophysical-table .. --cc-method
/// .. --ref-et .. --t-ref .. --uhi-max .. --params .. --output ..`, expecting a
/// float GeoTIFF at `--output`. A run longer than `timeout` is killed and
/// counts as a failure of that scenario.
#[derive(Debug, Clone)]
pub struct ExternalUcm {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
    pub inputs: UcmInputs,
    pub timeout: Option<Duration>,
}

impl ExternalUcm {
    pub fn new(program: impl Into<PathBuf>, inputs: UcmInputs) -> Self {
        Self { program: program.into(), prefix_args: Vec::new(), inputs, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, ModelError> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait()?);
        };
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                // already exited between the two calls if this fails
                let _ = child.kill();
                let _ = child.wait();
                return Err(ModelError::Failed(format!(
                    "{} timed out after {:.1}s",
                    self.program.display(),
                    timeout.as_secs_f64()
                )));
            }
            thread::sleep(POLL_INTERVAL.min(timeout));
        }
    }

    fn command(&self, lulc: &Path, params: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .arg("--lulc")
            .arg(lulc)
            .arg("--biophysical-table")
            .arg(&self.inputs.biophysical_table)
            .arg("--cc-method")
            .arg(&self.inputs.cc_method)
            .arg("--ref-et")
            .arg(&self.inputs.ref_et_raster)
            .arg("--t-ref")
            .arg(self.inputs.t_ref.to_string())
            .arg("--uhi-max")
            .arg(self.inputs.uhi_max.to_string())
            .arg("--params")
            .arg(params)
            .arg("--output")
            .arg(output);
        cmd
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n")
}

impl TemperatureModel for ExternalUcm {
    fn predict_temperature(&self, lulc: &LulcRaster, scratch_dir: &Path) -> Result<Vec<f32>, ModelError> {
        let lulc_path = scratch_dir.join("lulc.tif");
        let params_path = scratch_dir.join("params.json");
        let output_path = scratch_dir.join("t.tif");

        raster_io::write_lulc(&lulc_path, lulc).map_err(|e| ModelError::Transient(format!("{e:#}")))?;
        let params = serde_json::to_vec(&self.inputs.params).map_err(|e| ModelError::Failed(e.to_string()))?;
        fs::write(&params_path, params)?;

        // stderr goes to a file so a chatty model cannot block on a full pipe
        let stderr_path = scratch_dir.join("stderr.log");
        let mut cmd = self.command(&lulc_path, &params_path, &output_path);
        cmd.stdout(Stdio::null()).stderr(fs::File::create(&stderr_path)?);
        debug!(?cmd, "running urban cooling model");
        let mut child = cmd
            .spawn()
            .map_err(|e| ModelError::Failed(format!("cannot run {}: {e}", self.program.display())))?;
        let status = self.wait(&mut child)?;
        if !status.success() {
            let stderr = fs::read(&stderr_path).unwrap_or_default();
            return Err(ModelError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                status,
                stderr_tail(&stderr)
            )));
        }

        let t = raster_io::read_float(&output_path).map_err(|e| ModelError::Failed(format!("{e:#}")))?;
        if (t.info.height, t.info.width) != lulc.shape() {
            return Err(ModelError::ShapeMismatch { expected: lulc.len(), actual: t.data.len() });
        }
        Ok(t.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> UcmInputs {
        let mut inputs = UcmInputs::new("table.csv", "ref_et.tif", 18.5, 6.0);
        inputs.params.insert("k_gi".into(), serde_json::json!(0.6));
        inputs
    }

    #[test]
    fn command_line_carries_fixed_inputs() {
        let ucm = ExternalUcm::new("ucm-run", inputs());
        let cmd = ucm.command(Path::new("/s/lulc.tif"), Path::new("/s/params.json"), Path::new("/s/t.tif"));
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "ucm-run");
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--t-ref") + 1], "18.5");
        assert_eq!(args[pos("--cc-method") + 1], "factors");
        assert_eq!(args[pos("--output") + 1], "/s/t.tif");
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let err = b"a\nb\nc\nd\ne\nf\ng\n";
        assert_eq!(stderr_tail(err), "c\nd\ne\nf\ng");
    }

    #[test]
    fn failing_command_is_a_model_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ucm = ExternalUcm::new("false", inputs());
        let lulc = LulcRaster::filled(2, 2, 1, 0);
        let err = ucm.predict_temperature(&lulc, dir.path());
        assert!(matches!(err, Err(ModelError::Failed(_))));
        assert!(dir.path().join("lulc.tif").exists());
        assert!(dir.path().join("params.json").exists());
    }

    #[test]
    fn stderr_of_a_failing_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut ucm = ExternalUcm::new("sh", inputs());
        ucm.prefix_args = vec!["-c".into(), "echo solver diverged >&2; exit 3".into(), "sh".into()];
        let err = ucm.predict_temperature(&LulcRaster::filled(2, 2, 1, 0), dir.path()).unwrap_err();
        assert!(err.to_string().contains("solver diverged"), "{err}");
    }

    #[test]
    fn missing_executable_is_not_transient() {
        let dir = tempfile::tempdir().unwrap();
        let ucm = ExternalUcm::new("/nonexistent/ucm-predict", inputs());
        let err = ucm.predict_temperature(&LulcRaster::filled(2, 2, 1, 0), dir.path()).unwrap_err();
        assert!(matches!(err, ModelError::Failed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn hung_model_is_killed_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut ucm = ExternalUcm::new("sh", inputs()).with_timeout(Duration::from_millis(200));
        ucm.prefix_args = vec!["-c".into(), "sleep 10".into(), "sh".into()];
        let start = Instant::now();
        let err = ucm.predict_temperature(&LulcRaster::filled(2, 2, 1, 0), dir.path()).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(&err, ModelError::Failed(msg) if msg.contains("timed out")), "{err}");
        assert!(!err.is_transient());
    }
}
