//! The instrumentor: turns an analysis into per-function save/restore
//! plans.
//!
//! A function in the instrumentation set gets a [`FnPlan`] naming exactly
//! the points where it must participate in the suspend protocol:
//!
//! - *checked call sites* — calls to a suspending import, to another
//!   instrumented function, or indirect calls through a tainted class.
//!   After such a call returns, the function inspects the controller and,
//!   if an unwind is in flight, saves its frame and propagates outward.
//! - *checked loop back-edges* — every loop in the function, so a
//!   suspension inside a tight loop can interrupt it without first
//!   exiting.
//! - the *entry rewind check* — implied by the plan's existence: on entry
//!   during a rewind, the function restores its saved frame and jumps to
//!   the recorded resume location.
//!
//! Functions outside the set get no plan and are never checked. If one of
//! them ends up on the stack when an unwind begins (an incomplete
//! suspending-import declaration, or an incorrect override list), its
//! frame is silently omitted from the buffer and the rewind will corrupt
//! execution. That hazard is inherent to static reachability and is the
//! caller's responsibility whenever overrides are used.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use unspool_graph::{Analysis, FuncId, Program, SiteTarget};

/// Save/restore plan for one instrumented function.
#[derive(Debug, Clone, Default)]
pub struct FnPlan {
    /// Paths of call sites that carry the post-call unwind check.
    pub checked_sites: FxHashSet<Vec<usize>>,
    /// Paths of loop back-edges that carry the unwind check.
    pub checked_loops: FxHashSet<Vec<usize>>,
}

impl FnPlan {
    /// Whether the call site at `path` is checked.
    pub fn is_checked_site(&self, path: &[usize]) -> bool {
        self.checked_sites.contains(path)
    }

    /// Whether the loop back-edge at `path` is checked.
    pub fn is_checked_loop(&self, path: &[usize]) -> bool {
        self.checked_loops.contains(path)
    }
}

/// A program plus the instrumentation plans the engine executes it with.
#[derive(Debug)]
pub struct InstrumentedProgram {
    program: Arc<Program>,
    plans: FxHashMap<FuncId, FnPlan>,
}

impl InstrumentedProgram {
    /// The underlying program.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The plan for a function, if it is instrumented.
    pub fn plan(&self, func: FuncId) -> Option<&FnPlan> {
        self.plans.get(&func)
    }

    /// Whether the function is in the instrumentation set.
    pub fn is_instrumented(&self, func: FuncId) -> bool {
        self.plans.contains_key(&func)
    }

    /// Number of instrumented functions.
    pub fn instrumented_count(&self) -> usize {
        self.plans.len()
    }
}

/// Build the instrumentation plans for every member of the analysis'
/// instrumentation set.
pub fn instrument(program: Arc<Program>, analysis: &Analysis) -> InstrumentedProgram {
    let mut plans = FxHashMap::default();
    for &func in &analysis.instrumented {
        let mut plan = FnPlan::default();
        for site in program.call_sites(func) {
            let checked = match site.target {
                SiteTarget::Import(import) => analysis.suspending_imports.contains(&import),
                SiteTarget::Func(callee) => analysis.instrumented.contains(&callee),
                SiteTarget::Class(class) => analysis.tainted_classes.contains(&class),
            };
            if checked {
                plan.checked_sites.insert(site.path);
            }
        }
        for edge in program.loop_edges(func) {
            plan.checked_loops.insert(edge);
        }
        plans.insert(func, plan);
    }
    InstrumentedProgram { program, plans }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unspool_graph::{analyze, Callee, Op, ProgramBuilder, ResolvedConfig, Value};

    #[test]
    fn test_checked_sites_select_suspending_targets() {
        let mut builder = ProgramBuilder::new();
        let sleep = builder.import("host.sleep", 0);
        let log = builder.import("host.log", 0);
        let helper = builder.function("helper", 0, 0, vec![Op::Call {
            dst: None,
            callee: Callee::Import(sleep),
            args: vec![],
        }]);
        let pure = builder.function("pure", 0, 0, vec![]);
        let main = builder.function("main", 0, 0, vec![
            Op::Call { dst: None, callee: Callee::Import(log), args: vec![] },
            Op::Call { dst: None, callee: Callee::Func(pure), args: vec![] },
            Op::Call { dst: None, callee: Callee::Func(helper), args: vec![] },
        ]);
        let program = builder.build().unwrap();
        let analysis = analyze(&program, &ResolvedConfig::suspending_imports([sleep]));
        let instrumented = instrument(Arc::new(program), &analysis);

        assert!(instrumented.is_instrumented(main));
        assert!(instrumented.is_instrumented(helper));
        assert!(!instrumented.is_instrumented(pure));

        let plan = instrumented.plan(main).unwrap();
        // Only the call to the instrumented helper is checked; the
        // non-suspending import and the pure function are not.
        assert!(!plan.is_checked_site(&[0]));
        assert!(!plan.is_checked_site(&[1]));
        assert!(plan.is_checked_site(&[2]));

        let helper_plan = instrumented.plan(helper).unwrap();
        assert!(helper_plan.is_checked_site(&[0]));
    }

    #[test]
    fn test_every_loop_edge_is_checked() {
        let mut builder = ProgramBuilder::new();
        let tick = builder.import("host.tick", 0);
        let f = builder.function("f", 0, 1, vec![
            Op::Loop {
                body: vec![
                    Op::Loop {
                        body: vec![
                            Op::Call { dst: None, callee: Callee::Import(tick), args: vec![] },
                            Op::Break,
                        ],
                    },
                    Op::Const { dst: 0, value: Value::Bool(true) },
                    Op::BreakIf { cond: 0 },
                ],
            },
        ]);
        let program = builder.build().unwrap();
        let analysis = analyze(&program, &ResolvedConfig::suspending_imports([tick]));
        let instrumented = instrument(Arc::new(program), &analysis);
        let plan = instrumented.plan(f).unwrap();
        assert!(plan.is_checked_loop(&[0]));
        assert!(plan.is_checked_loop(&[0, 0]));
    }

    #[test]
    fn test_uninstrumented_functions_have_no_plan() {
        let mut builder = ProgramBuilder::new();
        let f = builder.function("f", 0, 0, vec![]);
        let program = builder.build().unwrap();
        let analysis = analyze(&program, &ResolvedConfig::default());
        let instrumented = instrument(Arc::new(program), &analysis);
        assert!(instrumented.plan(f).is_none());
        assert_eq!(instrumented.instrumented_count(), 0);
    }
}
