pub mod compiler;
pub mod context;
pub mod core;
pub mod engine;
pub mod join;
pub mod mil;
pub mod runtime;
pub mod scope;
pub mod simplify;

use tracing::debug_span;

pub use context::{CompileContext, CompileOptions, CompileOptionsBuilder, ScopeId};
pub use crate::core::{CoreBuilder, CoreTree};
pub use engine::{ExecError, execute};
pub use mil::MilProgram;
pub use runtime::{Error, ErrorClass, ErrorCode};
pub use scope::VarTable;

/// Run the whole backend over `tree`: simplification, join recognition,
/// the variable table and translation. The input tree is left untouched.
pub fn compile_core(tree: &CoreTree, options: &CompileOptions) -> Result<MilProgram, Error> {
    let mut tree = tree.clone();
    let mut ctx = CompileContext::new(options.clone());
    if options.simplify {
        simplify::simplify(&mut tree, options)?;
    }
    if options.recognize_joins {
        join::recognize_joins(&mut tree)?;
    }
    let vars = {
        let _span = debug_span!("variable_table").entered();
        VarTable::build(&tree, &mut ctx)?
    };
    let _span = debug_span!("translate").entered();
    compiler::translate(&tree, &vars, options)
}
