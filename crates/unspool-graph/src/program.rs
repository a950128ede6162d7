//! Call graph program model.
//!
//! A [`Program`] is the immutable static representation the analyzer and
//! the runtime both consume: functions with abstract bodies, declared host
//! imports, and indirect-call classes. Bodies are not a bytecode; they are
//! just enough structure to give every call site and loop back-edge an
//! addressable location (a *path* of indices through nested bodies), since
//! those are the only places execution may suspend.

use crate::value::Value;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Identifies a function in the program.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);

impl FuncId {
    /// Create a FuncId from a raw index.
    pub fn from_u32(id: u32) -> Self {
        FuncId(id)
    }

    /// Get the raw index.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Identifies a declared host import.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportId(u32);

impl ImportId {
    /// Create an ImportId from a raw index.
    pub fn from_u32(id: u32) -> Self {
        ImportId(id)
    }

    /// Get the raw index.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Identifies an indirect-call class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    /// Create a ClassId from a raw index.
    pub fn from_u32(id: u32) -> Self {
        ClassId(id)
    }

    /// Get the raw index.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Index of a local slot within a function frame.
pub type Slot = usize;

/// Target of a direct call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Callee {
    /// Another function in the program.
    Func(FuncId),
    /// A declared host import.
    Import(ImportId),
}

/// One abstract operation in a function body.
///
/// Straight-line ops manipulate local slots and cannot suspend. `Call` and
/// `CallIndirect` are the analysis edges and the save/restore points;
/// `Loop` back-edges are the other save/restore points. `If` and `Loop`
/// nest bodies, which is what makes locations paths rather than flat
/// indices.
#[derive(Debug, Clone)]
pub enum Op {
    /// Store a constant into a slot.
    Const {
        /// Destination slot
        dst: Slot,
        /// Constant value
        value: Value,
    },
    /// Copy one slot to another.
    Copy {
        /// Destination slot
        dst: Slot,
        /// Source slot
        src: Slot,
    },
    /// Integer/float addition.
    Add {
        /// Destination slot
        dst: Slot,
        /// Left operand slot
        lhs: Slot,
        /// Right operand slot
        rhs: Slot,
    },
    /// Integer/float subtraction.
    Sub {
        /// Destination slot
        dst: Slot,
        /// Left operand slot
        lhs: Slot,
        /// Right operand slot
        rhs: Slot,
    },
    /// Integer/float multiplication.
    Mul {
        /// Destination slot
        dst: Slot,
        /// Left operand slot
        lhs: Slot,
        /// Right operand slot
        rhs: Slot,
    },
    /// Equality comparison; stores a bool.
    Eq {
        /// Destination slot
        dst: Slot,
        /// Left operand slot
        lhs: Slot,
        /// Right operand slot
        rhs: Slot,
    },
    /// Less-than comparison; stores a bool.
    Lt {
        /// Destination slot
        dst: Slot,
        /// Left operand slot
        lhs: Slot,
        /// Right operand slot
        rhs: Slot,
    },
    /// Boolean negation.
    Not {
        /// Destination slot
        dst: Slot,
        /// Source slot (must hold a bool)
        src: Slot,
    },
    /// Append a slot's value to the observable output log.
    Emit {
        /// Source slot
        src: Slot,
    },
    /// Direct call to a function or import.
    Call {
        /// Slot receiving the call result, if any
        dst: Option<Slot>,
        /// Call target
        callee: Callee,
        /// Argument slots
        args: Vec<Slot>,
    },
    /// Indirect call through a call class; the target function reference
    /// is read from a slot at run time.
    CallIndirect {
        /// Slot receiving the call result, if any
        dst: Option<Slot>,
        /// Call class constraining the candidate targets
        class: ClassId,
        /// Slot holding the `Value::Func` target
        target: Slot,
        /// Argument slots
        args: Vec<Slot>,
    },
    /// Two-armed conditional.
    If {
        /// Condition slot (must hold a bool)
        cond: Slot,
        /// Ops executed when the condition is true
        then_body: Vec<Op>,
        /// Ops executed when the condition is false
        else_body: Vec<Op>,
    },
    /// Loop until `Break`. The implicit back-edge at the end of the body
    /// is a save/restore point in instrumented functions.
    Loop {
        /// Loop body
        body: Vec<Op>,
    },
    /// Exit the innermost loop.
    Break,
    /// Exit the innermost loop when the slot holds `true`.
    BreakIf {
        /// Condition slot
        cond: Slot,
    },
    /// Return from the function.
    Return {
        /// Slot holding the return value; `None` returns unit
        src: Option<Slot>,
    },
}

/// A function in the call graph.
///
/// Immutable once the program is built; the analyzer attaches its verdict
/// in a separate [`crate::Analysis`] rather than mutating the graph.
#[derive(Debug, Clone)]
pub struct Function {
    /// Function name (unique within the program)
    pub name: String,
    /// Number of parameter slots (filled from arguments)
    pub params: usize,
    /// Number of additional local slots (initialized to unit)
    pub locals: usize,
    /// Function body
    pub body: Vec<Op>,
}

impl Function {
    /// Total slot count of a frame for this function.
    pub fn slot_count(&self) -> usize {
        self.params + self.locals
    }
}

/// A declared host import. Bodies live host-side; the graph only knows the
/// name and arity.
#[derive(Debug, Clone)]
pub struct ImportDecl {
    /// Import name, e.g. `host.sleep`
    pub name: String,
    /// Number of arguments
    pub arity: usize,
}

/// An indirect-call class: the candidate targets sharing one call
/// signature. Built once by the [`ProgramBuilder`]; immutable.
#[derive(Debug, Clone)]
pub struct CallClass {
    /// Signature key, e.g. `(int) -> int`
    pub signature: String,
    /// Candidate targets (functions and/or imports)
    pub members: Vec<Callee>,
}

impl CallClass {
    /// Whether the class contains the given callee.
    pub fn contains(&self, callee: Callee) -> bool {
        self.members.contains(&callee)
    }
}

/// Location of a call site within a function: a path of indices through
/// nested bodies. After an `If` index the next element selects the branch
/// (0 = then, 1 = else); after a `Loop` index it is the body index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Path to the call op
    pub path: Vec<usize>,
    /// What the site calls
    pub target: SiteTarget,
}

/// Static target of a call site.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SiteTarget {
    /// Direct call to a function
    Func(FuncId),
    /// Direct call to an import
    Import(ImportId),
    /// Indirect call through a class
    Class(ClassId),
}

/// Errors raised while building a program.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Two functions share a name
    #[error("duplicate function name `{0}`")]
    DuplicateFunction(String),

    /// Two imports share a name
    #[error("duplicate import name `{0}`")]
    DuplicateImport(String),

    /// A declared function was never given a body
    #[error("function `{0}` declared but never defined")]
    UndefinedFunction(String),

    /// A function was defined twice
    #[error("function `{0}` defined twice")]
    RedefinedFunction(String),

    /// An op references a slot outside the frame
    #[error("slot {slot} out of range in function `{func}` ({limit} slots)")]
    SlotOutOfRange {
        /// Function name
        func: String,
        /// Offending slot
        slot: Slot,
        /// Frame slot count
        limit: usize,
    },

    /// `Break`/`BreakIf` used outside any loop
    #[error("break outside of a loop in function `{0}`")]
    BreakOutsideLoop(String),

    /// A direct call passes the wrong number of arguments
    #[error("call to `{callee}` in `{func}`: expected {expected} args, got {got}")]
    ArityMismatch {
        /// Calling function name
        func: String,
        /// Callee name
        callee: String,
        /// Declared arity
        expected: usize,
        /// Supplied argument count
        got: usize,
    },

    /// A call references a function or import id the program does not
    /// contain. Ids are plain indices, so a forged or stale id is a body
    /// error, not a panic.
    #[error("call in `{func}` targets an unknown callee id {id}")]
    UnknownCallee {
        /// Calling function name
        func: String,
        /// The raw offending id
        id: u32,
    },

    /// An indirect call references a class id the program does not contain
    #[error("indirect call in `{func}` uses unknown class id {id}")]
    UnknownClass {
        /// Calling function name
        func: String,
        /// The raw offending id
        id: u32,
    },
}

/// The immutable call graph program.
#[derive(Debug, Clone)]
pub struct Program {
    funcs: Vec<Function>,
    imports: Vec<ImportDecl>,
    classes: Vec<CallClass>,
    func_names: FxHashMap<String, FuncId>,
    import_names: FxHashMap<String, ImportId>,
}

impl Program {
    /// Look up a function by id.
    pub fn func(&self, id: FuncId) -> Option<&Function> {
        self.funcs.get(id.as_u32() as usize)
    }

    /// Look up an import declaration by id.
    pub fn import(&self, id: ImportId) -> Option<&ImportDecl> {
        self.imports.get(id.as_u32() as usize)
    }

    /// Look up a call class by id.
    pub fn class(&self, id: ClassId) -> Option<&CallClass> {
        self.classes.get(id.as_u32() as usize)
    }

    /// Resolve a function name.
    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    /// Resolve an import name.
    pub fn import_by_name(&self, name: &str) -> Option<ImportId> {
        self.import_names.get(name).copied()
    }

    /// Number of functions.
    pub fn func_count(&self) -> usize {
        self.funcs.len()
    }

    /// Iterate over all function ids.
    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.funcs.len() as u32).map(FuncId::from_u32)
    }

    /// Iterate over all class ids.
    pub fn class_ids(&self) -> impl Iterator<Item = ClassId> {
        (0..self.classes.len() as u32).map(ClassId::from_u32)
    }

    /// Every call site in the given function, in body order.
    pub fn call_sites(&self, id: FuncId) -> Vec<CallSite> {
        let mut sites = Vec::new();
        if let Some(func) = self.func(id) {
            collect_sites(&func.body, &mut Vec::new(), &mut sites);
        }
        sites
    }

    /// Paths of every loop back-edge in the given function.
    pub fn loop_edges(&self, id: FuncId) -> Vec<Vec<usize>> {
        let mut edges = Vec::new();
        if let Some(func) = self.func(id) {
            collect_loops(&func.body, &mut Vec::new(), &mut edges);
        }
        edges
    }
}

fn collect_sites(body: &[Op], path: &mut Vec<usize>, out: &mut Vec<CallSite>) {
    for (idx, op) in body.iter().enumerate() {
        match op {
            Op::Call { callee, .. } => {
                path.push(idx);
                let target = match callee {
                    Callee::Func(f) => SiteTarget::Func(*f),
                    Callee::Import(i) => SiteTarget::Import(*i),
                };
                out.push(CallSite { path: path.clone(), target });
                path.pop();
            }
            Op::CallIndirect { class, .. } => {
                path.push(idx);
                out.push(CallSite { path: path.clone(), target: SiteTarget::Class(*class) });
                path.pop();
            }
            Op::If { then_body, else_body, .. } => {
                path.push(idx);
                path.push(0);
                collect_sites(then_body, path, out);
                path.pop();
                path.push(1);
                collect_sites(else_body, path, out);
                path.pop();
                path.pop();
            }
            Op::Loop { body } => {
                path.push(idx);
                collect_sites(body, path, out);
                path.pop();
            }
            _ => {}
        }
    }
}

fn collect_loops(body: &[Op], path: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    for (idx, op) in body.iter().enumerate() {
        match op {
            Op::Loop { body } => {
                path.push(idx);
                out.push(path.clone());
                collect_loops(body, path, out);
                path.pop();
            }
            Op::If { then_body, else_body, .. } => {
                path.push(idx);
                path.push(0);
                collect_loops(then_body, path, out);
                path.pop();
                path.push(1);
                collect_loops(else_body, path, out);
                path.pop();
                path.pop();
            }
            _ => {}
        }
    }
}

/// Builder for [`Program`]. Functions may be declared first and defined
/// later so recursive and mutually recursive call graphs can be expressed.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    funcs: Vec<(String, usize, usize)>,
    bodies: Vec<Option<Vec<Op>>>,
    imports: Vec<ImportDecl>,
    classes: Vec<CallClass>,
    func_names: FxHashMap<String, FuncId>,
    import_names: FxHashMap<String, ImportId>,
    errors: Vec<BuildError>,
}

impl ProgramBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a host import.
    pub fn import(&mut self, name: &str, arity: usize) -> ImportId {
        let id = ImportId::from_u32(self.imports.len() as u32);
        if self.import_names.insert(name.to_string(), id).is_some() {
            self.errors.push(BuildError::DuplicateImport(name.to_string()));
        }
        self.imports.push(ImportDecl { name: name.to_string(), arity });
        id
    }

    /// Declare a function without a body. Must be defined before `build`.
    pub fn declare_function(&mut self, name: &str, params: usize, locals: usize) -> FuncId {
        let id = FuncId::from_u32(self.funcs.len() as u32);
        if self.func_names.insert(name.to_string(), id).is_some() {
            self.errors.push(BuildError::DuplicateFunction(name.to_string()));
        }
        self.funcs.push((name.to_string(), params, locals));
        self.bodies.push(None);
        id
    }

    /// Attach a body to a declared function.
    pub fn define(&mut self, id: FuncId, body: Vec<Op>) {
        let idx = id.as_u32() as usize;
        if self.bodies[idx].is_some() {
            self.errors.push(BuildError::RedefinedFunction(self.funcs[idx].0.clone()));
            return;
        }
        self.bodies[idx] = Some(body);
    }

    /// Declare and define a function in one step.
    pub fn function(&mut self, name: &str, params: usize, locals: usize, body: Vec<Op>) -> FuncId {
        let id = self.declare_function(name, params, locals);
        self.define(id, body);
        id
    }

    /// Register an indirect-call class.
    pub fn call_class(&mut self, signature: &str, members: Vec<Callee>) -> ClassId {
        let id = ClassId::from_u32(self.classes.len() as u32);
        self.classes.push(CallClass { signature: signature.to_string(), members });
        id
    }

    /// Validate and freeze the program.
    pub fn build(mut self) -> Result<Program, BuildError> {
        if let Some(err) = self.errors.drain(..).next() {
            return Err(err);
        }
        let mut funcs = Vec::with_capacity(self.funcs.len());
        for ((name, params, locals), body) in self.funcs.drain(..).zip(self.bodies.drain(..)) {
            let body = body.ok_or_else(|| BuildError::UndefinedFunction(name.clone()))?;
            funcs.push(Function { name, params, locals, body });
        }
        let program = Program {
            funcs,
            imports: self.imports,
            classes: self.classes,
            func_names: self.func_names,
            import_names: self.import_names,
        };
        for func in &program.funcs {
            validate_body(&program, func, &func.body, 0)?;
        }
        Ok(program)
    }
}

fn check_slot(func: &Function, slot: Slot) -> Result<(), BuildError> {
    if slot >= func.slot_count() {
        return Err(BuildError::SlotOutOfRange {
            func: func.name.clone(),
            slot,
            limit: func.slot_count(),
        });
    }
    Ok(())
}

fn check_slots(func: &Function, slots: &[Slot]) -> Result<(), BuildError> {
    for &slot in slots {
        check_slot(func, slot)?;
    }
    Ok(())
}

fn validate_body(
    program: &Program,
    func: &Function,
    body: &[Op],
    loop_depth: usize,
) -> Result<(), BuildError> {
    for op in body {
        match op {
            Op::Const { dst, .. } => check_slot(func, *dst)?,
            Op::Copy { dst, src } | Op::Not { dst, src } => {
                check_slots(func, &[*dst, *src])?;
            }
            Op::Add { dst, lhs, rhs }
            | Op::Sub { dst, lhs, rhs }
            | Op::Mul { dst, lhs, rhs }
            | Op::Eq { dst, lhs, rhs }
            | Op::Lt { dst, lhs, rhs } => {
                check_slots(func, &[*dst, *lhs, *rhs])?;
            }
            Op::Emit { src } => check_slot(func, *src)?,
            Op::Call { dst, callee, args } => {
                if let Some(dst) = dst {
                    check_slot(func, *dst)?;
                }
                check_slots(func, args)?;
                let (callee_name, expected) = match callee {
                    Callee::Func(f) => {
                        let callee = program.func(*f).ok_or_else(|| BuildError::UnknownCallee {
                            func: func.name.clone(),
                            id: f.as_u32(),
                        })?;
                        (callee.name.clone(), callee.params)
                    }
                    Callee::Import(i) => {
                        let decl = program.import(*i).ok_or_else(|| BuildError::UnknownCallee {
                            func: func.name.clone(),
                            id: i.as_u32(),
                        })?;
                        (decl.name.clone(), decl.arity)
                    }
                };
                if args.len() != expected {
                    return Err(BuildError::ArityMismatch {
                        func: func.name.clone(),
                        callee: callee_name,
                        expected,
                        got: args.len(),
                    });
                }
            }
            Op::CallIndirect { dst, class, target, args } => {
                if let Some(dst) = dst {
                    check_slot(func, *dst)?;
                }
                check_slot(func, *target)?;
                check_slots(func, args)?;
                if program.class(*class).is_none() {
                    return Err(BuildError::UnknownClass {
                        func: func.name.clone(),
                        id: class.as_u32(),
                    });
                }
            }
            Op::If { cond, then_body, else_body } => {
                check_slot(func, *cond)?;
                validate_body(program, func, then_body, loop_depth)?;
                validate_body(program, func, else_body, loop_depth)?;
            }
            Op::Loop { body } => {
                validate_body(program, func, body, loop_depth + 1)?;
            }
            Op::Break => {
                if loop_depth == 0 {
                    return Err(BuildError::BreakOutsideLoop(func.name.clone()));
                }
            }
            Op::BreakIf { cond } => {
                check_slot(func, *cond)?;
                if loop_depth == 0 {
                    return Err(BuildError::BreakOutsideLoop(func.name.clone()));
                }
            }
            Op::Return { src } => {
                if let Some(src) = src {
                    check_slot(func, *src)?;
                }
            }
        }
    }
    Ok(())
}
