//! MIL-style text rendering of the emitted program.
use std::fmt::{self, Write as _};

use super::{Atom, Expr, Extern, MilProgram, Proc, Stmt};

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Nil => f.write_str("nil"),
            Atom::Oid(o) => write!(f, "{o}@0"),
            Atom::Int(i) => write!(f, "{i}LL"),
            Atom::Dbl(d) => write!(f, "dbl({d})"),
            Atom::Str(s) => write!(f, "{s:?}"),
            Atom::Bit(b) => f.write_str(if *b { "true" } else { "false" }),
        }
    }
}

fn list(f: &mut fmt::Formatter<'_>, args: &[Expr]) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{a}")?;
    }
    Ok(())
}

impl fmt::Display for Extern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extern::Step { axis, test } => write!(f, "loop_lifted_{}_step_{test}", axis.name().replace('-', "_")),
            Extern::InstanceOf(t) => write!(f, "instance_of[{t}]"),
            other => f.write_str(other.name()),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(n) => f.write_str(n),
            Expr::Const(a) => write!(f, "{a}"),
            Expr::Column(atoms) => {
                f.write_str("bat(")?;
                for (i, a) in atoms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Expr::Project { value, like } => write!(f, "{like}.project({value})"),
            Expr::Count(e) => write!(f, "{e}.count()"),
            Expr::Mark { col, start } => write!(f, "{col}.mark({start}@0)"),
            Expr::MarkGrp(e) => write!(f, "{e}.mark_grp()"),
            Expr::Fetch { col, positions } => write!(f, "{col}.fetch({positions})"),
            Expr::Select { col, op, value } => write!(f, "{col}.select({} {value})", op.symbol()),
            Expr::SelectIn { col, set } => write!(f, "{col}.select_in({set})"),
            Expr::Diff { col, set } => write!(f, "{col}.kdiff({set})"),
            Expr::Locate { values, keys } => write!(f, "{values}.locate({keys})"),
            Expr::Lookup { probe, keys, values, default } => {
                write!(f, "{probe}.lookup({keys}, {values}, {default})")
            }
            Expr::Map1 { op, arg } => write!(f, "[{}]({arg})", op.name()),
            Expr::Map2 { op, left, right } => write!(f, "[{}]({left}, {right})", op.symbol()),
            Expr::Append(a, b) => write!(f, "{a}.append({b})"),
            Expr::Aggr { f: func, groups, values, domain } => {
                write!(f, "{{{}}}({values}, {groups}, {domain})", func.name())
            }
            Expr::Intern { container, values } => write!(f, "{}.addValues({values})", container.name()),
            Expr::Values { container, refs } => write!(f, "{}.fetch({refs})", container.name()),
            Expr::Deref { items, kinds } => write!(f, "deref({items}, {kinds})"),
            Expr::Sort(keys) => {
                f.write_str("sort(")?;
                for (i, (k, desc)) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}{}", if *desc { " desc" } else { "" })?;
                }
                f.write_str(")")
            }
            Expr::Unique(e) => write!(f, "{e}.tunique()"),
            Expr::EquiJoin { left, right } => write!(f, "join({left}, {right})"),
            Expr::ThetaJoin { left_iter, left_vals, right_iter, right_vals, op } => write!(
                f,
                "thetajoin({left_iter}, {left_vals}, {right_iter}, {right_vals}, {:?})",
                op.symbol()
            ),
            Expr::Merge { left, right } => write!(f, "merged_union({left}, {right})"),
            Expr::Nth(e, i) => write!(f, "{e}.{i}"),
            Expr::Call(ext, args) => {
                write!(f, "{ext}(")?;
                list(f, args)?;
                f.write_str(")")
            }
            Expr::CallProc(name, args) => {
                write!(f, "{name}(")?;
                list(f, args)?;
                f.write_str(")")
            }
        }
    }
}

struct Indented<'a> {
    stmts: &'a [Stmt],
    depth: usize,
}

impl fmt::Display for Indented<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pad = "  ".repeat(self.depth);
        let nested = |stmts| Indented { stmts, depth: self.depth + 1 };
        for s in self.stmts {
            match s {
                Stmt::Comment(c) => writeln!(f, "{pad}# {c}")?,
                Stmt::Declare(n, None) => writeln!(f, "{pad}var {n};")?,
                Stmt::Declare(n, Some(e)) => writeln!(f, "{pad}var {n} := {e};")?,
                Stmt::Assign(n, e) => writeln!(f, "{pad}{n} := {e};")?,
                Stmt::Free(n) => writeln!(f, "{pad}{n} := nil;")?,
                Stmt::Block(b) => {
                    writeln!(f, "{pad}{{")?;
                    write!(f, "{}", nested(b))?;
                    writeln!(f, "{pad}}}")?;
                }
                Stmt::If { cond, then, otherwise } => {
                    writeln!(f, "{pad}if ({cond}) {{")?;
                    write!(f, "{}", nested(then))?;
                    if otherwise.is_empty() {
                        writeln!(f, "{pad}}}")?;
                    } else {
                        writeln!(f, "{pad}}} else {{")?;
                        write!(f, "{}", nested(otherwise))?;
                        writeln!(f, "{pad}}}")?;
                    }
                }
                Stmt::Raise { code, message } => writeln!(f, "{pad}ERROR(\"{code}: {}\");", message.escape_default())?,
                Stmt::Exec(e) => writeln!(f, "{pad}{e};")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params = String::new();
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                params.push_str(", ");
            }
            write!(params, "BAT[void,any] {p}")?;
        }
        writeln!(f, "PROC {}({params}) : BAT[void,bat] {{", self.name)?;
        write!(f, "{}", Indented { stmts: &self.body, depth: 1 })?;
        let [i, p, it, k] = &self.result;
        writeln!(f, "  return bat(void,bat).append({i}).append({p}).append({it}).append({k});")?;
        writeln!(f, "}}")
    }
}

impl fmt::Display for MilProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# prologue")?;
        write!(f, "{}", Indented { stmts: &self.prologue, depth: 0 })?;
        for p in &self.procs {
            write!(f, "{p}")?;
        }
        writeln!(f, "# query")?;
        write!(f, "{}", Indented { stmts: &self.body, depth: 0 })?;
        writeln!(f, "# epilogue")?;
        write!(f, "{}", Indented { stmts: &self.epilogue, depth: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mil::{BinOp, Expr};

    #[test]
    fn renders_nested_if() {
        let prog = MilProgram {
            body: vec![Stmt::If {
                cond: Expr::map2(BinOp::Gt, Expr::count(Expr::var("loop000")), Expr::int(0)),
                then: vec![Stmt::assign("x", Expr::int(1))],
                otherwise: vec![],
            }],
            ..MilProgram::default()
        };
        let text = prog.render();
        assert!(text.contains("if ([>](loop000.count(), 0LL)) {\n  x := 1LL;\n}"), "{text}");
    }
}
