//! Advisory report: why each function is in the instrumentation set.
//!
//! Purely diagnostic. The report names every instrumented function along
//! with its minimal witness chain down to a suspending import, plus any
//! names from the configuration that failed to resolve. It has no effect
//! on analysis or runtime behavior.

use crate::analyzer::{Analysis, WitnessCause};
use crate::program::{FuncId, Program};
use serde::Serialize;
use std::io::{self, Write};
use termcolor::{Color, ColorSpec, WriteColor};

/// One instrumented function and its witness chain.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryEntry {
    /// Function name
    pub function: String,
    /// Short reason tag: `calls-import`, `transitive`, `indirect`,
    /// `added`, or `only`
    pub reason: String,
    /// Human-readable witness chain, outermost first
    pub chain: Vec<String>,
}

/// The full advisory report.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryReport {
    /// One entry per instrumented function, sorted by name
    pub entries: Vec<AdvisoryEntry>,
    /// Configuration names that failed to resolve
    pub notes: Vec<String>,
}

impl AdvisoryReport {
    /// Build the report from an analysis.
    pub fn from_analysis(program: &Program, analysis: &Analysis, notes: Vec<String>) -> Self {
        let mut entries: Vec<AdvisoryEntry> = analysis
            .instrumented
            .iter()
            .map(|&func| entry_for(program, analysis, func))
            .collect();
        entries.sort_by(|a, b| a.function.cmp(&b.function));
        Self { entries, notes }
    }

    /// Serialize the report as pretty-printed JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("report contains only strings")
    }

    /// Render the report as colored text.
    pub fn render(&self, out: &mut dyn WriteColor) -> io::Result<()> {
        let mut name_spec = ColorSpec::new();
        name_spec.set_fg(Some(Color::Green)).set_bold(true);
        let mut note_spec = ColorSpec::new();
        note_spec.set_fg(Some(Color::Yellow));

        for entry in &self.entries {
            out.set_color(&name_spec)?;
            write!(out, "{}", entry.function)?;
            out.reset()?;
            writeln!(out, " [{}]", entry.reason)?;
            for link in &entry.chain {
                writeln!(out, "    {}", link)?;
            }
        }
        for note in &self.notes {
            out.set_color(&note_spec)?;
            write!(out, "note")?;
            out.reset()?;
            writeln!(out, ": {}", note)?;
        }
        Ok(())
    }
}

fn entry_for(program: &Program, analysis: &Analysis, func: FuncId) -> AdvisoryEntry {
    let function = func_name(program, func);
    let reason = match analysis.causes.get(&func) {
        Some(WitnessCause::DirectImport { .. }) => "calls-import",
        Some(WitnessCause::ViaCallee { .. }) => "transitive",
        Some(WitnessCause::IndirectClass { .. }) => "indirect",
        Some(WitnessCause::Added) => "added",
        Some(WitnessCause::OnlyListed) | None => "only",
    };
    let chain = analysis
        .witness_chain(func)
        .into_iter()
        .map(|(holder, cause)| describe(program, holder, &cause))
        .collect();
    AdvisoryEntry { function, reason: reason.to_string(), chain }
}

fn describe(program: &Program, holder: FuncId, cause: &WitnessCause) -> String {
    let holder = func_name(program, holder);
    match cause {
        WitnessCause::DirectImport { path, import } => {
            let import = program
                .import(*import)
                .map(|decl| decl.name.clone())
                .unwrap_or_else(|| format!("import#{}", import.as_u32()));
            format!("{} calls suspending import `{}` at {:?}", holder, import, path)
        }
        WitnessCause::ViaCallee { path, callee } => {
            format!("{} calls `{}` at {:?}", holder, func_name(program, *callee), path)
        }
        WitnessCause::IndirectClass { path, class } => {
            let signature = program
                .class(*class)
                .map(|c| c.signature.clone())
                .unwrap_or_else(|| format!("class#{}", class.as_u32()));
            format!("{} calls indirectly through `{}` at {:?}", holder, signature, path)
        }
        WitnessCause::Added => format!("{} listed in the add override", holder),
        WitnessCause::OnlyListed => format!("{} listed in the only override", holder),
    }
}

fn func_name(program: &Program, func: FuncId) -> String {
    program
        .func(func)
        .map(|f| f.name.clone())
        .unwrap_or_else(|| format!("func#{}", func.as_u32()))
}
