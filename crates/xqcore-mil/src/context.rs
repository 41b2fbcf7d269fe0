//! Per-compilation state threaded through every pass.
//!
//! Scope and variable identifiers are handed out here rather than from
//! process-wide counters, so each compilation starts from scratch and the
//! passes can be exercised on their own with a synthetic context.

/// Scope identifier ("fid"). Strictly increases with nesting depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

/// Scope ids of user-defined function bodies start here, far above any
/// nesting reachable from the query body.
pub const FUNCTION_SCOPE_BASE: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub simplify: bool,
    pub recognize_joins: bool,
    /// Run the Emission Buffer's peephole pass.
    pub optimize: bool,
    pub comments: bool,
    pub dynamic_typeswitch: bool,
    pub serialize_result: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            simplify: true,
            recognize_joins: true,
            optimize: true,
            comments: true,
            dynamic_typeswitch: true,
            serialize_result: true,
        }
    }
}

impl CompileOptions {
    pub fn builder() -> CompileOptionsBuilder {
        CompileOptionsBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptionsBuilder {
    opts: CompileOptions,
}

impl CompileOptionsBuilder {
    pub fn simplify(mut self, on: bool) -> Self {
        self.opts.simplify = on;
        self
    }
    pub fn recognize_joins(mut self, on: bool) -> Self {
        self.opts.recognize_joins = on;
        self
    }
    pub fn optimize(mut self, on: bool) -> Self {
        self.opts.optimize = on;
        self
    }
    pub fn comments(mut self, on: bool) -> Self {
        self.opts.comments = on;
        self
    }
    pub fn dynamic_typeswitch(mut self, on: bool) -> Self {
        self.opts.dynamic_typeswitch = on;
        self
    }
    pub fn serialize_result(mut self, on: bool) -> Self {
        self.opts.serialize_result = on;
        self
    }
    pub fn build(self) -> CompileOptions {
        self.opts
    }
}

#[derive(Debug, Clone)]
pub struct CompileContext {
    pub options: CompileOptions,
    next_fid: u32,
    next_function_fid: u32,
    next_vid: u32,
}

impl CompileContext {
    pub fn new(options: CompileOptions) -> Self {
        Self { options, next_fid: 0, next_function_fid: FUNCTION_SCOPE_BASE, next_vid: 0 }
    }

    /// Fresh scope id for a loop in the query body (the body itself is scope 0).
    pub fn fresh_scope(&mut self) -> ScopeId {
        self.next_fid += 1;
        ScopeId(self.next_fid)
    }

    /// Fresh scope id inside a user-defined function body.
    pub fn fresh_function_scope(&mut self) -> ScopeId {
        self.next_function_fid += 1;
        ScopeId(self.next_function_fid)
    }

    pub fn fresh_vid(&mut self) -> u32 {
        self.next_vid += 1;
        self.next_vid
    }
}

impl Default for CompileContext {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_fresh_per_context() {
        let mut a = CompileContext::default();
        assert_eq!(a.fresh_scope(), ScopeId(1));
        assert_eq!(a.fresh_scope(), ScopeId(2));
        let mut b = CompileContext::default();
        assert_eq!(b.fresh_scope(), ScopeId(1));
        assert!(b.fresh_function_scope().0 > FUNCTION_SCOPE_BASE);
    }

    #[test]
    fn builder_overrides_defaults() {
        let o = CompileOptions::builder().recognize_joins(false).comments(false).build();
        assert!(!o.recognize_joins);
        assert!(!o.comments);
        assert!(o.simplify);
    }
}
