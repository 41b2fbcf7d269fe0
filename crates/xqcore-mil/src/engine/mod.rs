//! Reference executor for emitted programs.
//!
//! [`Machine`] interprets a [`MilProgram`] over plain vectors. Value
//! containers are machine state shared by the prologue, the query body and
//! every procedure; variables live in per-invocation frames, with the
//! prologue's assignments visible everywhere.
//!
//! ```
//! use xqcore_mil::core::CoreBuilder;
//! use xqcore_mil::engine::{Item, execute};
//! use xqcore_mil::engine::store::Store;
//! use xqcore_mil::{CompileOptions, compile_core};
//!
//! let mut b = CoreBuilder::new();
//! let q = b.int_seq(&[1, 2]);
//! let tree = b.finish(q);
//! let program = compile_core(&tree, &CompileOptions::default()).unwrap();
//! let result = execute(&program, &mut Store::new()).unwrap();
//! assert_eq!(result.items(), vec![Item::Int(1), Item::Int(2)]);
//! ```
use std::collections::HashMap;

use compact_str::CompactString;
use tracing::{debug, trace};

use crate::core::QName;
use crate::mil::{Atom, Container, Expr, Kind, MilProgram, Name, Stmt};
use crate::runtime::{Error, ErrorCode};

pub mod ops;
pub mod serialize;
pub mod store;
pub mod value;

use store::{NodeRef, Store};
use value::{AtomKey, Column, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// Raised by the program; carries the W3C code.
    #[error("{code}: {message}")]
    Dynamic { code: ErrorCode, message: String },
    /// The program violated the column algebra's contract.
    #[error("executor fault: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn dynamic(code: ErrorCode, message: impl Into<String>) -> Self {
        ExecError::Dynamic { code, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ExecError::Internal(message.into())
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ExecError::Dynamic { code, .. } => Some(*code),
            ExecError::Internal(_) => None,
        }
    }
}

impl From<ExecError> for Error {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Dynamic { code, message } => Error::from_code(code, message),
            ExecError::Internal(m) => Error::internal(m),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Nesting limit for procedure calls.
    pub max_call_depth: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { max_call_depth: 256 }
    }
}

/// A result item with its value resolved from the containers.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Bool(bool),
    Int(i64),
    Dec(f64),
    Dbl(f64),
    Str(String),
    Untyped(String),
    QName(String),
    Node(NodeRef),
}

impl Item {
    pub fn to_text(&self, store: &Store) -> String {
        match self {
            Item::Bool(b) => b.to_string(),
            Item::Int(i) => i.to_string(),
            Item::Dec(d) => value::format_decimal(*d).to_string(),
            Item::Dbl(d) => value::format_double(*d).to_string(),
            Item::Str(s) | Item::Untyped(s) | Item::QName(s) => s.clone(),
            Item::Node(n) => store.string_value(*n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub iter: u64,
    pub pos: i64,
    pub item: Item,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
    /// Text written by the epilogue's result printer.
    pub output: String,
}

impl QueryResult {
    pub fn items(&self) -> Vec<Item> {
        self.rows.iter().map(|r| r.item.clone()).collect()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ValueContainer {
    values: Vec<Atom>,
    index: HashMap<AtomKey, u64>,
}

impl ValueContainer {
    fn intern(&mut self, a: &Atom) -> Atom {
        if a.is_nil() {
            return Atom::Nil;
        }
        let key = AtomKey::from(a);
        if let Some(o) = self.index.get(&key) {
            return Atom::Oid(*o);
        }
        let o = self.values.len() as u64;
        self.values.push(a.clone());
        self.index.insert(key, o);
        Atom::Oid(o)
    }

    fn get(&self, r: &Atom) -> Result<Atom, ExecError> {
        match r {
            Atom::Nil => Ok(Atom::Nil),
            Atom::Oid(o) => self
                .values
                .get(*o as usize)
                .cloned()
                .ok_or_else(|| ExecError::internal(format!("container reference {o} out of range"))),
            other => Err(ExecError::internal(format!("container reference {other:?} is not an oid"))),
        }
    }
}

pub(crate) type Frame = HashMap<Name, Value>;

pub struct Machine<'a> {
    program: &'a MilProgram,
    store: &'a mut Store,
    options: EngineOptions,
    containers: [ValueContainer; 5],
    globals: Frame,
    depth: usize,
    output: String,
}

/// Run `program` against `store` with default options.
pub fn execute(program: &MilProgram, store: &mut Store) -> Result<QueryResult, ExecError> {
    Machine::new(program, store, EngineOptions::default()).run()
}

impl<'a> Machine<'a> {
    pub fn new(program: &'a MilProgram, store: &'a mut Store, options: EngineOptions) -> Self {
        Self {
            program,
            store,
            options,
            containers: Default::default(),
            globals: Frame::new(),
            depth: 0,
            output: String::new(),
        }
    }

    pub fn run(mut self) -> Result<QueryResult, ExecError> {
        let program = self.program;
        let mut globals = Frame::new();
        self.exec_block(&program.prologue, &mut globals)?;
        self.globals = globals;
        let mut frame = Frame::new();
        self.exec_block(&program.body, &mut frame)?;
        self.exec_block(&program.epilogue, &mut frame)?;
        let [iter, pos, item, kind] = &program.result;
        let cols = [iter, pos, item, kind]
            .map(|n| self.lookup(&frame, n).and_then(|v| v.as_column()));
        let [iter, pos, item, kind] = cols;
        let (iter, pos, item, kind) = (iter?, pos?, item?, kind?);
        if [pos.len(), item.len(), kind.len()].iter().any(|l| *l != iter.len()) {
            return Err(ExecError::internal("result columns are not aligned"));
        }
        let mut rows = Vec::with_capacity(iter.len());
        for i in 0..iter.len() {
            let it = match &iter[i] {
                Atom::Oid(o) => *o,
                other => return Err(ExecError::internal(format!("iteration {other:?} is not an oid"))),
            };
            let p = match &pos[i] {
                Atom::Int(p) => *p,
                _ => 0,
            };
            rows.push(ResultRow { iter: it, pos: p, item: self.item(&item[i], &kind[i])? });
        }
        debug!(rows = rows.len(), "program finished");
        Ok(QueryResult { rows, output: self.output })
    }

    pub(crate) fn container(&self, c: Container) -> &ValueContainer {
        &self.containers[c.index()]
    }

    pub(crate) fn intern(&mut self, c: Container, a: &Atom) -> Atom {
        self.containers[c.index()].intern(a)
    }

    pub(crate) fn kind_of(k: &Atom) -> Result<Kind, ExecError> {
        match k {
            Atom::Int(c) => Kind::from_code(*c).ok_or_else(|| ExecError::internal(format!("unknown kind code {c}"))),
            other => Err(ExecError::internal(format!("kind {other:?} is not a code"))),
        }
    }

    pub(crate) fn node_of(item: &Atom) -> Result<NodeRef, ExecError> {
        match item {
            Atom::Oid(o) => u32::try_from(*o)
                .map(NodeRef)
                .map_err(|_| ExecError::internal(format!("node reference {o} out of range"))),
            other => Err(ExecError::internal(format!("node reference {other:?} is not an oid"))),
        }
    }

    /// The raw value of a generic item; nodes yield their string value.
    pub(crate) fn deref(&self, item: &Atom, kind: &Atom) -> Result<Atom, ExecError> {
        let k = Self::kind_of(kind)?;
        match k.container() {
            Some(c) => self.container(c).get(item),
            None if k == Kind::Bool => Ok(match item {
                Atom::Oid(o) => Atom::Bit(*o != 0),
                other => other.clone(),
            }),
            None => Ok(Atom::Str(CompactString::from(self.store.string_value(Self::node_of(item)?)))),
        }
    }

    pub(crate) fn item(&self, item: &Atom, kind: &Atom) -> Result<Item, ExecError> {
        let k = Self::kind_of(kind)?;
        if k.is_node() {
            return Ok(Item::Node(Self::node_of(item)?));
        }
        let v = self.deref(item, kind)?;
        let text = |a: &Atom| match a {
            Atom::Str(s) => s.to_string(),
            other => format!("{other}"),
        };
        Ok(match (k, &v) {
            (Kind::Bool, Atom::Bit(b)) => Item::Bool(*b),
            (Kind::Int, Atom::Int(i)) => Item::Int(*i),
            (Kind::Dec, Atom::Dbl(d)) => Item::Dec(*d),
            (Kind::Dbl, Atom::Dbl(d)) => Item::Dbl(*d),
            (Kind::Str, a) => Item::Str(text(a)),
            (Kind::UntypedAtomic, a) => Item::Untyped(text(a)),
            (Kind::QName, a) => Item::QName(text(a)),
            (k, v) => return Err(ExecError::internal(format!("value {v:?} does not fit kind {}", k.name()))),
        })
    }

    pub(crate) fn qname(&self, r: &Atom) -> Result<QName, ExecError> {
        match self.container(Container::QName).get(r)? {
            Atom::Str(clark) => Ok(match clark.strip_prefix('{').and_then(|s| s.split_once('}')) {
                Some((ns, local)) => QName::new(None, local, Some(ns)),
                None => QName::local(&clark),
            }),
            other => Err(ExecError::internal(format!("QName container holds {other:?}"))),
        }
    }

    pub(crate) fn store(&self) -> &Store {
        &*self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store {
        &mut *self.store
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        if !self.output.is_empty() {
            self.output.push('\n');
        }
        self.output.push_str(text);
    }

    fn lookup(&self, frame: &Frame, name: &str) -> Result<Value, ExecError> {
        frame
            .get(name)
            .or_else(|| self.globals.get(name))
            .cloned()
            .ok_or_else(|| ExecError::internal(format!("unbound variable {name}")))
    }

    pub(crate) fn exec_block(&mut self, stmts: &[Stmt], frame: &mut Frame) -> Result<(), ExecError> {
        for s in stmts {
            match s {
                Stmt::Comment(_) => {}
                Stmt::Declare(n, None) => {
                    frame.insert(n.clone(), Value::Scalar(Atom::Nil));
                }
                Stmt::Declare(n, Some(e)) | Stmt::Assign(n, e) => {
                    let v = self.eval(e, frame)?;
                    frame.insert(n.clone(), v);
                }
                Stmt::Free(n) => {
                    frame.remove(n);
                }
                Stmt::Block(b) => self.exec_block(b, frame)?,
                Stmt::If { cond, then, otherwise } => {
                    let taken = matches!(self.eval(cond, frame)?.as_scalar()?, Atom::Bit(true));
                    self.exec_block(if taken { then } else { otherwise }, frame)?;
                }
                Stmt::Raise { code, message } => return Err(ExecError::dynamic(*code, message.clone())),
                Stmt::Exec(e) => {
                    self.eval(e, frame)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn col(&mut self, e: &Expr, frame: &mut Frame) -> Result<Column, ExecError> {
        self.eval(e, frame)?.as_column()
    }

    pub(crate) fn eval(&mut self, e: &Expr, frame: &mut Frame) -> Result<Value, ExecError> {
        match e {
            Expr::Var(n) => self.lookup(frame, n),
            Expr::Const(a) => Ok(Value::Scalar(a.clone())),
            Expr::Column(atoms) => Ok(Value::column(atoms.clone())),
            Expr::CallProc(name, args) => self.call_proc(name, args, frame),
            other => self.eval_op(other, frame),
        }
    }

    fn call_proc(&mut self, name: &str, args: &[Expr], frame: &mut Frame) -> Result<Value, ExecError> {
        let program = self.program;
        let proc = program.proc(name).ok_or_else(|| ExecError::internal(format!("unknown procedure {name}")))?;
        if args.len() != proc.params.len() {
            return Err(ExecError::internal(format!("{name} expects {} arguments", proc.params.len())));
        }
        if self.depth >= self.options.max_call_depth {
            return Err(ExecError::internal(format!("call depth limit {} exceeded in {name}", self.options.max_call_depth)));
        }
        let mut callee = Frame::new();
        for (p, a) in proc.params.iter().zip(args) {
            let v = self.eval(a, frame)?;
            callee.insert(p.clone(), v);
        }
        trace!(proc = %name, depth = self.depth, "call");
        self.depth += 1;
        let outcome = self.exec_block(&proc.body, &mut callee);
        self.depth -= 1;
        outcome?;
        let mut out = Vec::with_capacity(4);
        for r in &proc.result {
            out.push(self.lookup(&callee, r)?.as_column()?);
        }
        Ok(Value::Tuple(out))
    }
}
