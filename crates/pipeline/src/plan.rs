//! Tool plans: the ordered commands a job runs in its workspace.

use std::fmt;
use std::path::Path;

use a6hub_core::build_settings::{pdk_family, BuildSettings, SimulationSettings, Simulator};
use a6hub_core::types::DbId;

use crate::config::ToolPaths;

/// Generated LibreLane config file name inside the workspace.
pub const LIBRELANE_CONFIG_FILE: &str = "config.json";

const RUN_TAG: &str = "a6hub";
const ICARUS_OUTPUT: &str = "sim.vvp";
const VERILATOR_BINARY: &str = "Vsim";

/// Program plus leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Copy of `self` with `extra` appended to the arguments.
    pub fn extend<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = self.clone();
        cmd.args.extend(extra.into_iter().map(Into::into));
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub command: CommandSpec,
    /// Stage entered when the step starts, for tools whose output does not
    /// announce it.
    pub stage: Option<&'static str>,
    /// Best-effort command run after the step is killed.
    pub cleanup: Option<CommandSpec>,
}

impl PlanStep {
    fn new(command: CommandSpec) -> Self {
        Self {
            command,
            stage: None,
            cleanup: None,
        }
    }

    fn in_stage(mut self, stage: &'static str) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// LibreLane RTL-to-GDSII flow on the workspace's `config.json`.
///
/// With `use_docker` the tool runs in a named container so a killed job can
/// also remove its container.
pub fn build_plan(
    job_id: DbId,
    settings: &BuildSettings,
    tools: &ToolPaths,
    workspace: &Path,
) -> Vec<PlanStep> {
    let pdk = pdk_family(&settings.pdk);
    let flow_args = ["--pdk", pdk, "--run-tag", RUN_TAG, "--overwrite"];

    if settings.use_docker {
        let container = format!("a6hub-job-{job_id}");
        let image = tools
            .librelane_image
            .clone()
            .unwrap_or_else(|| settings.docker_image.clone());
        let mount = format!("{}:/design", workspace.display());

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--init".into(),
            "--name".into(),
            container.clone(),
            "-v".into(),
            mount,
            "-w".into(),
            "/design".into(),
            image,
            "librelane".into(),
        ];
        args.extend(flow_args.iter().map(|a| a.to_string()));
        args.push(LIBRELANE_CONFIG_FILE.into());

        let mut step = PlanStep::new(tools.docker.extend(args));
        step.cleanup = Some(tools.docker.extend(["rm", "-f", container.as_str()]));
        vec![step]
    } else {
        let args = flow_args
            .iter()
            .copied()
            .chain(std::iter::once(LIBRELANE_CONFIG_FILE));
        vec![PlanStep::new(tools.librelane.extend(args))]
    }
}

/// Compile then run the testbench with the selected simulator.
pub fn simulation_plan(
    settings: &SimulationSettings,
    sources: &[String],
    tools: &ToolPaths,
    workspace: &Path,
) -> Vec<PlanStep> {
    let top = settings.top_module();
    match settings.simulator {
        Simulator::Icarus => {
            let mut compile: Vec<String> = vec![
                "-g2012".into(),
                "-o".into(),
                ICARUS_OUTPUT.into(),
                "-s".into(),
                top.to_string(),
            ];
            compile.extend(sources.iter().cloned());
            vec![
                PlanStep::new(tools.iverilog.extend(compile)).in_stage("compile"),
                PlanStep::new(tools.vvp.extend([ICARUS_OUTPUT])).in_stage("simulate"),
            ]
        }
        Simulator::Verilator => {
            let mut compile: Vec<String> = vec![
                "--binary".into(),
                "-j".into(),
                "0".into(),
                "--top-module".into(),
                top.to_string(),
                "-o".into(),
                VERILATOR_BINARY.into(),
            ];
            compile.extend(sources.iter().cloned());
            vec![
                PlanStep::new(tools.verilator.extend(compile)).in_stage("compile"),
                PlanStep::new(CommandSpec::new(
                    workspace
                        .join("obj_dir")
                        .join(VERILATOR_BINARY)
                        .display()
                        .to_string(),
                ))
                .in_stage("simulate"),
            ]
        }
    }
}
