//! Report generation
//!
//! Plain-text summaries of the registered annotations and of a trace replay.

use crate::callbacks::InvocationCounts;
use insn_annotation::{AnnotationRegistry, ExecutionState, SimReport};
use std::fmt::{self, Write};

const RULE: &str = "═══════════════════════════════════════════════";

/// Render the registered annotation table, one section per module
pub fn registry_summary(registry: &AnnotationRegistry) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_registry(&mut out, registry);
    out
}

/// Render the outcome of a replay
pub fn replay_summary(report: &SimReport, counts: &InvocationCounts) -> String {
    let mut out = String::new();
    let _ = write_replay(&mut out, report, counts);
    out
}

fn write_registry(out: &mut String, registry: &AnnotationRegistry) -> fmt::Result {
    writeln!(out, "{}", RULE)?;
    writeln!(out, "  Registered Annotations")?;
    writeln!(out, "{}\n", RULE)?;

    if registry.is_empty() {
        writeln!(out, "  (none)")?;
        return Ok(());
    }

    for module in registry.modules() {
        let Some(table) = registry.lookup(module) else {
            continue;
        };
        writeln!(out, "📦 {} ({} annotation(s))", module, table.len())?;
        for annotation in table.iter() {
            writeln!(out, "  {}", annotation)?;
        }
        writeln!(out)?;
    }

    writeln!(
        out,
        "Total: {} annotation(s), {} callback(s)",
        registry.len(),
        registry.callback_names().len()
    )?;
    Ok(())
}

fn write_replay(out: &mut String, report: &SimReport, counts: &InvocationCounts) -> fmt::Result {
    writeln!(out, "{}", RULE)?;
    writeln!(out, "  Replay Summary")?;
    writeln!(out, "{}\n", RULE)?;

    let stats = &report.stats;
    writeln!(out, "📊 Dispatch:")?;
    writeln!(out, "  Hits:                 {}", stats.hits)?;
    writeln!(out, "  Forks:                {}", stats.forks)?;
    writeln!(out, "  Suppressed forks:     {}", stats.suppressed_forks)?;
    writeln!(out, "  Skips:                {}", stats.skips)?;
    writeln!(out, "  Terminations:         {}", stats.terminations)?;
    writeln!(out, "  Return registrations: {}", stats.return_registrations)?;
    writeln!(out, "  Return callbacks:     {}", stats.returns_fired)?;

    writeln!(out, "\n🔔 Callbacks:")?;
    for (name, count) in counts.iter() {
        writeln!(out, "  {:<20} {}", name, count)?;
    }

    writeln!(
        out,
        "\n🧵 States ({} in {} round(s), {} hook(s) installed):",
        report.states.len(),
        report.rounds,
        report.installer.hooks
    )?;
    for state in &report.states {
        writeln!(
            out,
            "  #{:<4} pid {:<6} executed {:<5} terminated {:<3} bypassed {:<3} {}",
            state.id(),
            state.pid(),
            state.executed().len(),
            state.terminated_steps(),
            state.bypasses().len(),
            state.constraints().join(" && ")
        )?;
    }

    Ok(())
}
