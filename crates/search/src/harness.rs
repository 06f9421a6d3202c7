//! Build + benchmark of one candidate against the host build tree.
//!
//! [`BenchmarkHarness`] is the seam the controller drives; [`ProcessHarness`]
//! is the real one. Every child runs in its own process group under a
//! timeout; on expiry the whole group is killed, so compilers started by a
//! build script do not outlive it. Thread settings reach the child only
//! through its own arguments and environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use ternary_codegen::KernelBundle;
use ternary_common::{Result, RunSettings, TuneError, TunerConfig, WorkloadKind};

use crate::report::{parse_throughput, ReportFormat};
use crate::types::Measurement;

/// Environment variable carrying the SIMD flags into the build.
pub const CFLAGS_ENV: &str = "TERNARY_KERNEL_CFLAGS";

/// Lines of compiler/workload output kept in error messages.
const DIAGNOSTIC_LINES: usize = 20;

/// What the controller needs from a build tree.
pub trait BenchmarkHarness {
    /// Install `bundle` and rebuild the workload binary.
    fn build(&mut self, bundle: &KernelBundle) -> Result<()>;

    /// Run the canonical workload once and report its throughput.
    fn run(&mut self) -> Result<Measurement>;

    /// Rebuild whatever kernel sources the tree currently holds, e.g. the
    /// originals put back at the end of a session.
    fn rebuild(&mut self) -> Result<()>;

    /// Forget any cached notion of what the tree currently holds.
    fn invalidate(&mut self) {}
}

/// Harness driving the real build command and workload binary.
pub struct ProcessHarness {
    base_dir: PathBuf,
    header_path: PathBuf,
    ini_path: PathBuf,
    model_path: PathBuf,
    build_command: Vec<String>,
    build_timeout: Duration,
    run: RunSettings,
    handle: Handle,
    built: Option<String>,
    /// Flags of the last installed bundle, reused for [`rebuild`](BenchmarkHarness::rebuild).
    cflags: Option<String>,
}

impl ProcessHarness {
    /// Paths are resolved against `config.base_dir`. `handle` drives the
    /// child processes; call the harness from a blocking thread.
    pub fn new(config: &TunerConfig, handle: Handle) -> Self {
        let mut run = config.run.clone();
        run.binary = config.resolve(&run.binary);
        Self {
            base_dir: config.base_dir.clone(),
            header_path: config.resolve(&config.kernel_header),
            ini_path: config.resolve(&config.kernel_ini),
            model_path: config.resolve(&config.model_path),
            build_command: config.build_command.clone(),
            build_timeout: Duration::from_secs(config.build_timeout_secs),
            run,
            handle,
            built: None,
            cflags: None,
        }
    }

    /// Fatal setup checks done once before a session starts.
    pub fn preflight(&self) -> Result<()> {
        if !self.model_path.is_file() {
            return Err(TuneError::Setup(format!(
                "model file not found: {}",
                self.model_path.display()
            )));
        }
        if !self.run.binary.is_file() {
            return Err(TuneError::Setup(format!(
                "benchmark binary not found: {} (build the tree once first)",
                self.run.binary.display()
            )));
        }
        if self.build_command.is_empty() {
            return Err(TuneError::Setup("empty build command".into()));
        }
        Ok(())
    }

    /// Run the build command on the tree as it stands.
    fn run_build(&self) -> Result<()> {
        let (program, args) = match self.build_command.split_first() {
            Some(split) => split,
            None => return Err(TuneError::Setup("empty build command".into())),
        };
        let mut envs = Vec::new();
        if let Some(flags) = &self.cflags {
            envs.push((CFLAGS_ENV, flags.clone()));
        }
        let finished = self.handle.block_on(run_child(
            program,
            args,
            &self.base_dir,
            &envs,
            self.build_timeout,
            Step::Build,
        ))?;
        if !finished.success {
            let diagnostic = if finished.stderr.trim().is_empty() {
                last_lines(&finished.stdout, DIAGNOSTIC_LINES)
            } else {
                last_lines(&finished.stderr, DIAGNOSTIC_LINES)
            };
            warn!(status = ?finished.status, "Build failed");
            return Err(TuneError::BuildFailure {
                status: finished.status,
                diagnostic,
            });
        }
        Ok(())
    }

    /// Arguments of one workload invocation.
    fn workload_args(&self) -> Vec<String> {
        let model = self.model_path.display().to_string();
        let r = &self.run;
        match r.kind {
            WorkloadKind::Bench => vec![
                "-m".into(),
                model,
                "-p".into(),
                r.prompt_tokens.to_string(),
                "-n".into(),
                r.gen_tokens.to_string(),
                "-t".into(),
                r.threads.to_string(),
                "-r".into(),
                r.repetitions.to_string(),
            ],
            WorkloadKind::Cli => vec![
                "-m".into(),
                model,
                "-p".into(),
                r.prompt.clone(),
                "-n".into(),
                r.gen_tokens.to_string(),
                "-t".into(),
                r.threads.to_string(),
                "-no-cnv".into(),
            ],
        }
    }
}

/// Exit status and combined output of a finished child.
struct Finished {
    status: Option<i32>,
    success: bool,
    stdout: String,
    stderr: String,
}

/// Which step a child belongs to; decides how its failures are reported.
#[derive(Debug, Clone, Copy)]
enum Step {
    Build,
    Benchmark,
}

impl Step {
    fn label(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Benchmark => "benchmark",
        }
    }

    /// A child that could not be started or waited on fails its candidate.
    fn unstartable(self, program: &str, err: &std::io::Error) -> TuneError {
        let message = format!("could not run {program}: {err}");
        match self {
            Self::Build => TuneError::BuildFailure {
                status: None,
                diagnostic: message,
            },
            Self::Benchmark => TuneError::BenchmarkRun(message),
        }
    }
}

async fn run_child(
    program: &str,
    args: &[String],
    cwd: &Path,
    envs: &[(&str, String)],
    limit: Duration,
    step: Step,
) -> Result<Finished> {
    let mut std_cmd = std::process::Command::new(program);
    std_cmd
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in envs {
        std_cmd.env(k, v);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }
    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| step.unstartable(program, &e))?;
    let pid = child.id();
    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(out)) => Ok(Finished {
            status: out.status.code(),
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(step.unstartable(program, &e)),
        Err(_) => {
            kill_group(pid);
            warn!(
                program,
                step = step.label(),
                secs = limit.as_secs(),
                "Child timed out; process group killed"
            );
            Err(TuneError::BenchmarkTimeout {
                stage: step.label(),
                secs: limit.as_secs(),
            })
        }
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this child.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

impl BenchmarkHarness for ProcessHarness {
    fn build(&mut self, bundle: &KernelBundle) -> Result<()> {
        if self.built.as_deref() == Some(bundle.fingerprint.as_str()) {
            debug!(fingerprint = &bundle.fingerprint[..12], "Tree already built for this bundle");
            return Ok(());
        }
        self.built = None;
        bundle.install(&self.header_path, &self.ini_path)?;
        self.cflags = Some(bundle.cflags());
        self.run_build()?;
        info!(fingerprint = &bundle.fingerprint[..12], "Build complete");
        self.built = Some(bundle.fingerprint.clone());
        Ok(())
    }

    fn run(&mut self) -> Result<Measurement> {
        let program = self.run.binary.display().to_string();
        let envs = [("OMP_NUM_THREADS", self.run.threads.to_string())];
        let finished = self.handle.block_on(run_child(
            &program,
            &self.workload_args(),
            &self.base_dir,
            &envs,
            Duration::from_secs(self.run.timeout_secs),
            Step::Benchmark,
        ))?;
        if !finished.success {
            return Err(TuneError::BenchmarkRun(format!(
                "exit {:?}: {}",
                finished.status,
                last_lines(&finished.stderr, DIAGNOSTIC_LINES)
            )));
        }
        let combined = format!("{}\n{}", finished.stdout, finished.stderr);
        let m = parse_throughput(ReportFormat::from(self.run.kind), &combined)?;
        debug!(tokens_per_second = m.tokens_per_second, "Workload measured");
        Ok(m)
    }

    fn rebuild(&mut self) -> Result<()> {
        self.built = None;
        self.run_build()?;
        info!("Build tree rebuilt");
        Ok(())
    }

    fn invalidate(&mut self) {
        self.built = None;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use ternary_codegen::emit_plan;
    use ternary_common::{KernelArch, ModelProfile};

    fn script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn bundle() -> KernelBundle {
        let p = ModelProfile::builtin("bitnet_b1_58-3B").unwrap();
        emit_plan(&p.default_plan(KernelArch::Mad), &p.kernels).unwrap()
    }

    fn setup(dir: &Path, build: &[&str], bench_body: &str) -> TunerConfig {
        std::fs::write(dir.join("model.gguf"), b"gguf").unwrap();
        script(&dir.join("bench.sh"), bench_body);
        let mut c = TunerConfig {
            base_dir: dir.to_path_buf(),
            model_path: "model.gguf".into(),
            build_command: build.iter().map(|s| s.to_string()).collect(),
            build_timeout_secs: 5,
            ..TunerConfig::default()
        };
        c.run.binary = "bench.sh".into();
        c.run.threads = 3;
        c.run.timeout_secs = 5;
        c
    }

    #[test]
    fn build_and_run_round() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = setup(
            dir.path(),
            &["sh", "-c", "echo \"$TERNARY_KERNEL_CFLAGS\" > cflags.txt"],
            "echo \"| model | test | t/s |\"\necho \"| m | tg128 | ${OMP_NUM_THREADS}1.5 ± 0.1 |\"",
        );
        let mut h = ProcessHarness::new(&config, rt.handle().clone());
        h.preflight().unwrap();

        let b = bundle();
        h.build(&b).unwrap();
        let flags = std::fs::read_to_string(dir.path().join("cflags.txt")).unwrap();
        assert_eq!(flags.trim(), b.cflags());
        let header = std::fs::read_to_string(config.resolve(&config.kernel_header)).unwrap();
        assert_eq!(header, b.header);

        // Same fingerprint: no rebuild.
        std::fs::remove_file(dir.path().join("cflags.txt")).unwrap();
        h.build(&b).unwrap();
        assert!(!dir.path().join("cflags.txt").exists());

        let m = h.run().unwrap();
        assert_eq!(m.tokens_per_second, 31.5);
    }

    #[test]
    fn build_failure_carries_diagnostic() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path(), &["sh", "-c", "echo 'error: boom' >&2; exit 3"], "true");
        let mut h = ProcessHarness::new(&config, rt.handle().clone());
        match h.build(&bundle()).unwrap_err() {
            TuneError::BuildFailure { status, diagnostic } => {
                assert_eq!(status, Some(3));
                assert!(diagnostic.contains("error: boom"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn timeouts_and_bad_output() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = setup(dir.path(), &["sleep", "10"], "echo nothing useful");
        config.build_timeout_secs = 1;
        let mut h = ProcessHarness::new(&config, rt.handle().clone());
        assert!(matches!(
            h.build(&bundle()),
            Err(TuneError::BenchmarkTimeout { stage: "build", .. })
        ));
        assert!(matches!(h.run(), Err(TuneError::BenchmarkParseFailure(_))));
    }

    #[test]
    fn timeout_kills_background_compilers() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = setup(
            dir.path(),
            &["sh", "-c", "(sleep 3; touch still_compiling) & wait"],
            "true",
        );
        config.build_timeout_secs = 1;
        let mut h = ProcessHarness::new(&config, rt.handle().clone());
        assert!(matches!(
            h.build(&bundle()),
            Err(TuneError::BenchmarkTimeout { stage: "build", .. })
        ));
        std::thread::sleep(Duration::from_secs(4));
        assert!(!dir.path().join("still_compiling").exists());
    }

    #[test]
    fn missing_programs_fail_the_candidate() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path(), &["./no-such-build-tool"], "true");
        let mut h = ProcessHarness::new(&config, rt.handle().clone());
        let err = h.build(&bundle()).unwrap_err();
        assert!(matches!(err, TuneError::BuildFailure { status: None, .. }), "{err}");
        assert!(err.is_candidate_local());

        std::fs::remove_file(dir.path().join("bench.sh")).unwrap();
        let err = h.run().unwrap_err();
        assert!(matches!(err, TuneError::BenchmarkRun(_)), "{err}");
        assert!(err.is_candidate_local());
    }

    #[test]
    fn rebuild_reuses_last_flags() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = setup(
            dir.path(),
            &["sh", "-c", "echo \"$TERNARY_KERNEL_CFLAGS\" >> builds.txt"],
            "true",
        );
        let mut h = ProcessHarness::new(&config, rt.handle().clone());
        let b = bundle();
        h.build(&b).unwrap();
        h.rebuild().unwrap();
        let builds = std::fs::read_to_string(dir.path().join("builds.txt")).unwrap();
        let lines: Vec<&str> = builds.lines().collect();
        assert_eq!(lines, vec![b.cflags().as_str(), b.cflags().as_str()]);

        // The rebuilt tree no longer matches the bundle, so it builds again.
        h.build(&b).unwrap();
        let builds = std::fs::read_to_string(dir.path().join("builds.txt")).unwrap();
        assert_eq!(builds.lines().count(), 3);
    }

    #[test]
    fn preflight_reports_missing_model() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = setup(dir.path(), &["true"], "true");
        config.model_path = "missing.gguf".into();
        let h = ProcessHarness::new(&config, rt.handle().clone());
        assert!(matches!(h.preflight(), Err(TuneError::Setup(_))));
    }
}
