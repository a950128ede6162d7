//! Whole-program suspend reachability.
//!
//! Computes the least fixed point of "F must be instrumented if F directly
//! calls a suspending import, directly calls an instrumented function, or
//! (under the conservative policy) makes an indirect call through a class
//! containing a suspending target". The function set is finite and the
//! relation is monotonic, so the work queue always terminates, and the
//! resulting set does not depend on processing order. The queue is FIFO so
//! each function's recorded witness cause is at minimal edge distance from
//! a suspending import.
//!
//! The analysis itself never fails. Incorrect override lists are a
//! documented runtime hazard, surfaced (if at all) as state corruption on
//! rewind, never as an analysis error.

use crate::config::{IndirectCallPolicy, ResolvedConfig};
use crate::program::{Callee, ClassId, FuncId, ImportId, Program, SiteTarget};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Why a function is in the instrumentation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WitnessCause {
    /// Directly calls a suspending import.
    DirectImport {
        /// Call site path
        path: Vec<usize>,
        /// The suspending import
        import: ImportId,
    },
    /// Calls a function that is itself instrumented; the chain continues
    /// through the callee's own cause.
    ViaCallee {
        /// Call site path
        path: Vec<usize>,
        /// The instrumented callee
        callee: FuncId,
    },
    /// Makes an indirect call through a tainted class.
    IndirectClass {
        /// Call site path
        path: Vec<usize>,
        /// The tainted class
        class: ClassId,
    },
    /// Forced in by the ADD override list.
    Added,
    /// Listed in the ONLY override list.
    OnlyListed,
}

/// Result of the reachability analysis.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Final instrumentation set, after override composition.
    pub instrumented: FxHashSet<FuncId>,
    /// Closure-computed set, before overrides. Kept for the advisory
    /// report.
    pub computed: FxHashSet<FuncId>,
    /// Imports declared suspending.
    pub suspending_imports: FxHashSet<ImportId>,
    /// Classes that may dispatch to a suspending target. Empty under the
    /// ignore policy.
    pub tainted_classes: FxHashSet<ClassId>,
    /// Per-function witness causes.
    pub causes: FxHashMap<FuncId, WitnessCause>,
    /// The indirect-call policy the analysis ran with.
    pub policy: IndirectCallPolicy,
}

impl Analysis {
    /// Whether the function must support suspend/resume.
    pub fn is_instrumented(&self, func: FuncId) -> bool {
        self.instrumented.contains(&func)
    }

    /// The minimal witness edge chain for a function: successive causes
    /// down to a suspending import (or an override terminus).
    pub fn witness_chain(&self, func: FuncId) -> Vec<(FuncId, WitnessCause)> {
        let mut chain = Vec::new();
        let mut seen = FxHashSet::default();
        let mut current = func;
        while seen.insert(current) {
            let Some(cause) = self.causes.get(&current) else {
                break;
            };
            chain.push((current, cause.clone()));
            match cause {
                WitnessCause::ViaCallee { callee, .. } => current = *callee,
                _ => break,
            }
        }
        chain
    }
}

/// Override composition. Pure set algebra: when `only` is present the
/// result is exactly `only`; otherwise `(computed ∪ add) − remove`.
pub fn compose_overrides(
    computed: &FxHashSet<FuncId>,
    add: &FxHashSet<FuncId>,
    remove: &FxHashSet<FuncId>,
    only: Option<&FxHashSet<FuncId>>,
) -> FxHashSet<FuncId> {
    if let Some(only) = only {
        return only.clone();
    }
    let mut set = computed.clone();
    set.extend(add.iter().copied());
    for func in remove {
        set.remove(func);
    }
    set
}

/// Run the reachability analysis. Infallible by design.
pub fn analyze(program: &Program, config: &ResolvedConfig) -> Analysis {
    let conservative = config.policy == IndirectCallPolicy::Conservative;

    // Reverse indices over the call graph.
    let mut callers_of: FxHashMap<FuncId, Vec<(FuncId, Vec<usize>)>> = FxHashMap::default();
    let mut class_users: FxHashMap<ClassId, Vec<(FuncId, Vec<usize>)>> = FxHashMap::default();
    for caller in program.func_ids() {
        for site in program.call_sites(caller) {
            match site.target {
                SiteTarget::Func(callee) => {
                    callers_of.entry(callee).or_default().push((caller, site.path));
                }
                SiteTarget::Class(class) => {
                    class_users.entry(class).or_default().push((caller, site.path));
                }
                SiteTarget::Import(_) => {}
            }
        }
    }
    let mut classes_with_func: FxHashMap<FuncId, Vec<ClassId>> = FxHashMap::default();
    for class_id in program.class_ids() {
        let class = program.class(class_id).expect("id from class_ids");
        for member in &class.members {
            if let Callee::Func(func) = member {
                classes_with_func.entry(*func).or_default().push(class_id);
            }
        }
    }

    let mut computed: FxHashSet<FuncId> = FxHashSet::default();
    let mut causes: FxHashMap<FuncId, WitnessCause> = FxHashMap::default();
    let mut queue: VecDeque<FuncId> = VecDeque::new();
    let mut tainted: FxHashSet<ClassId> = FxHashSet::default();

    // A class containing a suspending import is tainted from the start.
    if conservative {
        for class_id in program.class_ids() {
            let class = program.class(class_id).expect("id from class_ids");
            let suspends = class.members.iter().any(|member| match member {
                Callee::Import(import) => config.suspending.contains(import),
                Callee::Func(_) => false,
            });
            if suspends {
                tainted.insert(class_id);
            }
        }
    }

    // Seed: direct calls to suspending imports, and indirect calls through
    // already-tainted classes.
    for func in program.func_ids() {
        if computed.contains(&func) {
            continue;
        }
        for site in program.call_sites(func) {
            let cause = match site.target {
                SiteTarget::Import(import) if config.suspending.contains(&import) => {
                    Some(WitnessCause::DirectImport { path: site.path, import })
                }
                SiteTarget::Class(class) if conservative && tainted.contains(&class) => {
                    Some(WitnessCause::IndirectClass { path: site.path, class })
                }
                _ => None,
            };
            if let Some(cause) = cause {
                computed.insert(func);
                causes.insert(func, cause);
                queue.push_back(func);
                break;
            }
        }
    }

    // Fixpoint: propagate to direct callers and, conservatively, to the
    // users of any class a newly instrumented function belongs to.
    while let Some(func) = queue.pop_front() {
        if let Some(callers) = callers_of.get(&func) {
            for (caller, path) in callers {
                if computed.insert(*caller) {
                    causes.insert(
                        *caller,
                        WitnessCause::ViaCallee { path: path.clone(), callee: func },
                    );
                    queue.push_back(*caller);
                }
            }
        }
        if conservative {
            if let Some(class_ids) = classes_with_func.get(&func) {
                for class in class_ids {
                    if !tainted.insert(*class) {
                        continue;
                    }
                    if let Some(users) = class_users.get(class) {
                        for (user, path) in users {
                            if computed.insert(*user) {
                                causes.insert(
                                    *user,
                                    WitnessCause::IndirectClass { path: path.clone(), class: *class },
                                );
                                queue.push_back(*user);
                            }
                        }
                    }
                }
            }
        }
    }

    let instrumented = compose_overrides(
        &computed,
        &config.add,
        &config.remove,
        config.only.as_ref(),
    );

    // Override-introduced members get a synthetic cause; closure-derived
    // causes are kept when available since they carry a real chain.
    for func in &instrumented {
        if !causes.contains_key(func) {
            let cause = if config.only.is_some() {
                WitnessCause::OnlyListed
            } else {
                WitnessCause::Added
            };
            causes.insert(*func, cause);
        }
    }

    Analysis {
        instrumented,
        computed,
        suspending_imports: config.suspending.clone(),
        tainted_classes: tainted,
        causes,
        policy: config.policy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Op, ProgramBuilder};

    /// main -> a -> b -> host.sleep, with c unreachable from any import.
    fn chain_program() -> (Program, [FuncId; 4], ImportId) {
        let mut builder = ProgramBuilder::new();
        let sleep = builder.import("host.sleep", 0);
        let main = builder.declare_function("main", 0, 0);
        let a = builder.declare_function("a", 0, 0);
        let b = builder.declare_function("b", 0, 0);
        let c = builder.declare_function("c", 0, 0);
        builder.define(main, vec![Op::Call { dst: None, callee: Callee::Func(a), args: vec![] }]);
        builder.define(a, vec![Op::Call { dst: None, callee: Callee::Func(b), args: vec![] }]);
        builder.define(b, vec![Op::Call { dst: None, callee: Callee::Import(sleep), args: vec![] }]);
        builder.define(c, vec![Op::Call { dst: None, callee: Callee::Func(a), args: vec![] }]);
        (builder.build().unwrap(), [main, a, b, c], sleep)
    }

    #[test]
    fn test_transitive_closure() {
        let (program, [main, a, b, c], sleep) = chain_program();
        let analysis = analyze(&program, &ResolvedConfig::suspending_imports([sleep]));
        assert!(analysis.is_instrumented(main));
        assert!(analysis.is_instrumented(a));
        assert!(analysis.is_instrumented(b));
        // c also reaches the import, through a.
        assert!(analysis.is_instrumented(c));
        assert_eq!(analysis.instrumented.len(), 4);
    }

    #[test]
    fn test_no_suspending_imports_means_empty_set() {
        let (program, _, _) = chain_program();
        let analysis = analyze(&program, &ResolvedConfig::default());
        assert!(analysis.instrumented.is_empty());
    }

    #[test]
    fn test_fixpoint_is_independent_of_declaration_order() {
        let (program, ids, sleep) = chain_program();
        let forward = analyze(&program, &ResolvedConfig::suspending_imports([sleep]));

        // Same graph, functions declared in reverse.
        let mut builder = ProgramBuilder::new();
        let sleep2 = builder.import("host.sleep", 0);
        let c = builder.declare_function("c", 0, 0);
        let b = builder.declare_function("b", 0, 0);
        let a = builder.declare_function("a", 0, 0);
        let main = builder.declare_function("main", 0, 0);
        builder.define(main, vec![Op::Call { dst: None, callee: Callee::Func(a), args: vec![] }]);
        builder.define(a, vec![Op::Call { dst: None, callee: Callee::Func(b), args: vec![] }]);
        builder.define(b, vec![Op::Call { dst: None, callee: Callee::Import(sleep2), args: vec![] }]);
        builder.define(c, vec![Op::Call { dst: None, callee: Callee::Func(a), args: vec![] }]);
        let reversed_program = builder.build().unwrap();
        let reversed = analyze(&reversed_program, &ResolvedConfig::suspending_imports([sleep2]));

        let names = |program: &Program, analysis: &Analysis| {
            let mut v: Vec<String> = analysis
                .instrumented
                .iter()
                .map(|f| program.func(*f).unwrap().name.clone())
                .collect();
            v.sort();
            v
        };
        assert_eq!(names(&program, &forward), names(&reversed_program, &reversed));
        let _ = ids;
    }

    #[test]
    fn test_witness_chain_is_minimal() {
        let (program, [main, a, b, _], sleep) = chain_program();
        let analysis = analyze(&program, &ResolvedConfig::suspending_imports([sleep]));
        let chain = analysis.witness_chain(main);
        // main -> a -> b -> import: three links, ending at the import.
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].0, main);
        assert!(matches!(chain[0].1, WitnessCause::ViaCallee { callee, .. } if callee == a));
        assert!(matches!(chain[1].1, WitnessCause::ViaCallee { callee, .. } if callee == b));
        assert!(matches!(chain[2].1, WitnessCause::DirectImport { import, .. } if import == sleep));
    }

    #[test]
    fn test_override_algebra() {
        let computed: FxHashSet<FuncId> = [1, 2, 3].map(FuncId::from_u32).into_iter().collect();
        let add: FxHashSet<FuncId> = [4].map(FuncId::from_u32).into_iter().collect();
        let remove: FxHashSet<FuncId> = [2].map(FuncId::from_u32).into_iter().collect();
        let only: FxHashSet<FuncId> = [7].map(FuncId::from_u32).into_iter().collect();

        let composed = compose_overrides(&computed, &add, &remove, None);
        let expected: FxHashSet<FuncId> = [1, 3, 4].map(FuncId::from_u32).into_iter().collect();
        assert_eq!(composed, expected);

        // ONLY discards everything else.
        assert_eq!(compose_overrides(&computed, &add, &remove, Some(&only)), only);
    }

    #[test]
    fn test_add_and_remove_overrides() {
        let (program, [main, a, b, c], sleep) = chain_program();
        let mut config = ResolvedConfig::suspending_imports([sleep]);
        config.remove.insert(a);
        let analysis = analyze(&program, &config);
        assert!(analysis.is_instrumented(main));
        assert!(!analysis.is_instrumented(a));
        assert!(analysis.is_instrumented(b));
        // The computed set is untouched by the overrides.
        assert!(analysis.computed.contains(&a));
        assert!(analysis.causes.contains_key(&c));
    }

    #[test]
    fn test_only_override_discards_computed() {
        let (program, [main, a, b, c], sleep) = chain_program();
        let mut config = ResolvedConfig::suspending_imports([sleep]);
        config.only = Some([c].into_iter().collect());
        let analysis = analyze(&program, &config);
        assert!(!analysis.is_instrumented(main));
        assert!(!analysis.is_instrumented(a));
        assert!(!analysis.is_instrumented(b));
        assert!(analysis.is_instrumented(c));
    }

    /// dispatch makes an indirect call through a class containing `target`,
    /// which calls the suspending import. `target` is never called
    /// directly.
    fn indirect_program() -> (Program, FuncId, FuncId, ImportId) {
        let mut builder = ProgramBuilder::new();
        let sleep = builder.import("host.sleep", 0);
        let target = builder.function("target", 0, 0, vec![Op::Call {
            dst: None,
            callee: Callee::Import(sleep),
            args: vec![],
        }]);
        let class = builder.call_class("() -> unit", vec![Callee::Func(target)]);
        let dispatch = builder.function("dispatch", 0, 1, vec![
            Op::Const { dst: 0, value: crate::value::Value::Func(target) },
            Op::CallIndirect { dst: None, class, target: 0, args: vec![] },
        ]);
        (builder.build().unwrap(), dispatch, target, sleep)
    }

    #[test]
    fn test_indirect_policy_conservative_vs_ignore() {
        let (program, dispatch, target, sleep) = indirect_program();

        let conservative = analyze(&program, &ResolvedConfig::suspending_imports([sleep]));
        assert!(conservative.is_instrumented(target));
        assert!(conservative.is_instrumented(dispatch));
        assert_eq!(conservative.tainted_classes.len(), 1);

        let mut config = ResolvedConfig::suspending_imports([sleep]);
        config.policy = IndirectCallPolicy::Ignore;
        let ignored = analyze(&program, &config);
        // The direct caller of the import is still instrumented, but the
        // indirect edge is not followed.
        assert!(ignored.is_instrumented(target));
        assert!(!ignored.is_instrumented(dispatch));
        assert!(ignored.tainted_classes.is_empty());
    }

    #[test]
    fn test_class_with_suspending_import_member_taints_users() {
        let mut builder = ProgramBuilder::new();
        let fetch = builder.import("host.fetch", 0);
        let class = builder.call_class("() -> int", vec![Callee::Import(fetch)]);
        let caller = builder.function("caller", 0, 1, vec![Op::CallIndirect {
            dst: None,
            class,
            target: 0,
            args: vec![],
        }]);
        let program = builder.build().unwrap();
        let analysis = analyze(&program, &ResolvedConfig::suspending_imports([fetch]));
        assert!(analysis.is_instrumented(caller));
        assert!(matches!(
            analysis.causes.get(&caller),
            Some(WitnessCause::IndirectClass { .. })
        ));
    }

    #[test]
    fn test_recursive_graph_terminates() {
        let mut builder = ProgramBuilder::new();
        let tick = builder.import("host.tick", 0);
        let even = builder.declare_function("even", 0, 0);
        let odd = builder.declare_function("odd", 0, 0);
        builder.define(even, vec![
            Op::Call { dst: None, callee: Callee::Func(odd), args: vec![] },
            Op::Call { dst: None, callee: Callee::Import(tick), args: vec![] },
        ]);
        builder.define(odd, vec![Op::Call { dst: None, callee: Callee::Func(even), args: vec![] }]);
        let program = builder.build().unwrap();
        let analysis = analyze(&program, &ResolvedConfig::suspending_imports([tick]));
        assert!(analysis.is_instrumented(even));
        assert!(analysis.is_instrumented(odd));
    }
}
