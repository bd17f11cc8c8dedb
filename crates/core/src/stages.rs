//! Pipeline stage tables and the output-line stage detector.
//!
//! Each job type has a static, ordered table of [`StageDescriptor`]s. A tool
//! output line is classified by case-insensitive substring match against
//! each stage's patterns; the first matching stage in table order wins.
//!
//! [`StageTracker`] keeps the per-job position in the table. It only ever
//! moves forward: a line that matches the current stage or an earlier one
//! is ignored, so `completed_steps` is always a prefix of the table.

use serde::Serialize;

/// One named phase of a tool flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    /// Lowercase substrings that identify this stage in tool output.
    #[serde(skip)]
    pub patterns: &'static [&'static str],
}

/// LibreLane classic RTL-to-GDSII flow.
pub const BUILD_STAGES: &[StageDescriptor] = &[
    StageDescriptor {
        name: "synthesis",
        label: "Synthesis",
        description: "Yosys logic synthesis to a gate-level netlist",
        patterns: &["yosys.synthesis", "yosys.jsonheader", "running synthesis"],
    },
    StageDescriptor {
        name: "floorplan",
        label: "Floorplanning",
        description: "Die/core area, IO placement and tap cells",
        patterns: &["openroad.floorplan", "floorplan", "tapendcapinsertion", "ioplacement"],
    },
    StageDescriptor {
        name: "pdn",
        label: "Power Distribution Network",
        description: "Power grid generation",
        patterns: &["generatepdn", "pdn generation", "power distribution network"],
    },
    StageDescriptor {
        name: "placement",
        label: "Placement",
        description: "Global and detailed standard-cell placement",
        patterns: &[
            "globalplacement",
            "detailedplacement",
            "global placement",
            "detailed placement",
        ],
    },
    StageDescriptor {
        name: "cts",
        label: "Clock Tree Synthesis",
        description: "Clock tree construction and resizing",
        patterns: &["openroad.cts", "clock tree"],
    },
    StageDescriptor {
        name: "routing",
        label: "Routing",
        description: "Global and detailed routing",
        patterns: &[
            "globalrouting",
            "detailedrouting",
            "global routing",
            "detailed routing",
        ],
    },
    StageDescriptor {
        name: "gds",
        label: "GDSII Generation",
        description: "Stream-out of the final layout",
        patterns: &["streamout", "stream out", "gdsii"],
    },
    StageDescriptor {
        name: "drc",
        label: "Design Rule Check",
        description: "Magic/KLayout design rule checks",
        patterns: &["magic.drc", "klayout.drc", "drc"],
    },
    StageDescriptor {
        name: "lvs",
        label: "Layout vs Schematic",
        description: "Netgen layout-versus-schematic comparison",
        patterns: &["netgen.lvs", "lvs"],
    },
];

/// Icarus/Verilator simulation flow.
pub const SIMULATION_STAGES: &[StageDescriptor] = &[
    StageDescriptor {
        name: "compile",
        label: "Compilation",
        description: "HDL compilation of design and testbench",
        patterns: &["compiling", "iverilog", "verilator"],
    },
    StageDescriptor {
        name: "elaborate",
        label: "Elaboration",
        description: "Model build and elaboration",
        patterns: &["elaborat", "building model", "vvp"],
    },
    StageDescriptor {
        name: "simulate",
        label: "Simulation",
        description: "Testbench execution",
        patterns: &["simulating", "vcd info", "$finish", "simulation"],
    },
];

/// Classify one output line against `table`.
///
/// Returns the first stage (in table order) that has a pattern contained in
/// the lowercased line.
pub fn detect_stage<'t>(table: &'t [StageDescriptor], line: &str) -> Option<&'t StageDescriptor> {
    let lowered = line.to_lowercase();
    table
        .iter()
        .find(|stage| stage.patterns.iter().any(|p| lowered.contains(p)))
}

/// Integer percentage of `completed` out of `total`, clamped to `0..=100`.
pub fn percent_of(completed: usize, total: usize) -> i16 {
    if total == 0 {
        return 0;
    }
    ((completed.min(total) * 100) / total) as i16
}

/// A forward move of the tracker, produced by [`StageTracker::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTransition {
    pub stage: &'static StageDescriptor,
    pub previous: Option<&'static str>,
    pub completed_steps: Vec<String>,
    pub progress_percent: i16,
}

/// Per-job stage position over a static table.
#[derive(Debug, Clone)]
pub struct StageTracker {
    table: &'static [StageDescriptor],
    current: Option<usize>,
    completed: Vec<String>,
}

impl StageTracker {
    pub fn new(table: &'static [StageDescriptor]) -> Self {
        Self {
            table,
            current: None,
            completed: Vec::new(),
        }
    }

    /// Rebuild a tracker from persisted progress (redelivered job).
    ///
    /// Unknown step names are dropped.
    pub fn resume(
        table: &'static [StageDescriptor],
        current_step: Option<&str>,
        completed_steps: &[String],
    ) -> Self {
        let mut tracker = Self::new(table);
        tracker.current = current_step.and_then(|name| tracker.index_of(name));
        tracker.completed = table
            .iter()
            .filter(|s| completed_steps.iter().any(|c| c == s.name))
            .map(|s| s.name.to_string())
            .collect();
        tracker
    }

    pub fn table(&self) -> &'static [StageDescriptor] {
        self.table
    }

    pub fn current(&self) -> Option<&'static StageDescriptor> {
        let table = self.table;
        self.current.map(|i| &table[i])
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed
    }

    pub fn progress_percent(&self) -> i16 {
        percent_of(self.completed.len(), self.table.len())
    }

    /// Feed one output line. Returns a transition when the line moves the
    /// job to a later stage.
    pub fn observe(&mut self, line: &str) -> Option<StageTransition> {
        let stage = detect_stage(self.table, line)?;
        self.enter(stage.name)
    }

    /// Move to the named stage directly. Used when the driver knows which
    /// stage a plan step belongs to. Same forward-only rule as [`observe`].
    ///
    /// [`observe`]: StageTracker::observe
    pub fn enter(&mut self, name: &str) -> Option<StageTransition> {
        let index = self.index_of(name)?;

        if self.current.is_some_and(|current| index <= current) {
            return None;
        }

        let previous = self.current().map(|s| s.name);
        let table = self.table;
        for passed in &table[..index] {
            self.mark_completed(passed.name);
        }
        self.current = Some(index);

        Some(StageTransition {
            stage: &table[index],
            previous,
            completed_steps: self.completed.clone(),
            progress_percent: self.progress_percent(),
        })
    }

    /// Mark every stage done once the tool plan exits cleanly. Stages the
    /// output never announced count as passed.
    pub fn finish(&mut self) {
        let table = self.table;
        for stage in table {
            self.mark_completed(stage.name);
        }
        self.current = table.len().checked_sub(1);
    }

    fn mark_completed(&mut self, name: &str) {
        if !self.completed.iter().any(|c| c == name) {
            self.completed.push(name.to_string());
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.table.iter().position(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
