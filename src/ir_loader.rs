//! A loader for the line-oriented textual module format.
//!
//! ```text
//! ; a comment
//! internal global @FP
//! global @table = @handler
//! extern func @free(%p)
//! internal func @main() {
//!   %val = alloca 8
//!   %fptr = load @FP
//!   store @foo, @FP
//!   %val2 = call %fptr(%val)
//!   ret
//! }
//! ```
//!
//! Globals and functions default to external linkage, exactly as symbols
//! do in the IR this format mirrors; `internal` narrows visibility and
//! `extern` marks a symbol defined in some other module.

use crate::ir::{FuncId, GepOffset, GlobalId, Insn, Linkage, LocalId, Module, Operand, Param, Ty};

struct FuncHeader {
    name: String,
    params: Vec<Param>,
    linkage: Linkage,
    is_vararg: bool,
    is_declaration: bool,
    body: Vec<(usize, String)>,
}

struct GlobalHeader {
    name: String,
    linkage: Linkage,
    is_declaration: bool,
    init: Option<String>,
}

/// Load a module from its textual form.
pub fn load_module(text: &str) -> Result<Module, String> {
    let (globals, funcs) = split_declarations(text)?;

    let mut module = Module::new();
    let mut global_ids: Vec<GlobalId> = Vec::new();
    for g in &globals {
        global_ids.push(module.add_global(g.name.clone(), g.linkage, g.is_declaration, None));
    }
    let mut func_ids: Vec<FuncId> = Vec::new();
    for f in &funcs {
        func_ids.push(module.add_function_signature(
            f.name.clone(),
            f.params.clone(),
            f.linkage,
            f.is_vararg,
            f.is_declaration,
        ));
    }

    for (g, &gid) in globals.iter().zip(&global_ids) {
        if let Some(init) = &g.init {
            let op = parse_symbol_operand(&module, init)
                .ok_or_else(|| format!("Unknown initializer {} for @{}", init, g.name))?;
            module.set_global_init(gid, op);
        }
    }

    for (f, &fid) in funcs.iter().zip(&func_ids) {
        if f.is_declaration {
            continue;
        }
        module.begin_body(fid);
        for (lineno, line) in &f.body {
            parse_body_line(&mut module, line)
                .map_err(|e| format!("line {}: {}", lineno, e))?;
        }
        module.end_function();
    }

    module.try_confirm_valid()?;
    Ok(module)
}

/// First pass: split the text into global and function headers, holding on
/// to the raw body lines of each defined function.
fn split_declarations(text: &str) -> Result<(Vec<GlobalHeader>, Vec<FuncHeader>), String> {
    let mut globals = Vec::new();
    let mut funcs: Vec<FuncHeader> = Vec::new();
    let mut in_body = false;

    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        if in_body {
            if line == "}" {
                in_body = false;
            } else {
                funcs
                    .last_mut()
                    .unwrap()
                    .body
                    .push((lineno, line.to_owned()));
            }
            continue;
        }

        let (linkage, is_declaration, rest) = if let Some(rest) = line.strip_prefix("internal ") {
            (Linkage::Internal, false, rest.trim())
        } else if let Some(rest) = line.strip_prefix("extern ") {
            (Linkage::External, true, rest.trim())
        } else {
            (Linkage::External, false, line)
        };

        if let Some(rest) = rest.strip_prefix("global ") {
            let (name, init) = match rest.split_once('=') {
                Some((n, i)) => (n.trim(), Some(i.trim().to_owned())),
                None => (rest.trim(), None),
            };
            if is_declaration && init.is_some() {
                return Err(format!("line {}: extern global with initializer", lineno));
            }
            let name = name
                .strip_prefix('@')
                .ok_or_else(|| format!("line {}: global name must start with @", lineno))?;
            globals.push(GlobalHeader {
                name: name.to_owned(),
                linkage,
                is_declaration,
                init: init.filter(|i| i != "null"),
            });
        } else if let Some(rest) = rest.strip_prefix("func ") {
            let has_brace = rest.trim_end().ends_with('{');
            let rest = rest.trim_end().trim_end_matches('{').trim();
            if !is_declaration && !has_brace {
                return Err(format!("line {}: defined function needs a body", lineno));
            }
            if is_declaration && has_brace {
                return Err(format!("line {}: extern function cannot have a body", lineno));
            }
            let (rest, is_vararg) = match rest.strip_suffix("vararg") {
                Some(r) => (r.trim(), true),
                None => (rest, false),
            };
            let (name, params) = rest
                .split_once('(')
                .ok_or_else(|| format!("line {}: malformed function header", lineno))?;
            let name = name
                .trim()
                .strip_prefix('@')
                .ok_or_else(|| format!("line {}: function name must start with @", lineno))?;
            let params = params
                .trim()
                .strip_suffix(')')
                .ok_or_else(|| format!("line {}: malformed parameter list", lineno))?;
            let params: Vec<Param> = params
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| {
                    let name = p
                        .strip_prefix('%')
                        .ok_or_else(|| format!("line {}: parameter must start with %", lineno))?;
                    Ok(Param {
                        name: name.to_owned(),
                        ty: Ty::Ptr,
                    })
                })
                .collect::<Result<_, String>>()?;
            funcs.push(FuncHeader {
                name: name.to_owned(),
                params,
                linkage,
                is_vararg,
                is_declaration,
                body: Vec::new(),
            });
            in_body = has_brace;
        } else {
            return Err(format!("line {}: unrecognized declaration: {}", lineno, line));
        }
    }
    if in_body {
        return Err("unterminated function body".to_owned());
    }
    Ok((globals, funcs))
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(i) => line[..i].trim(),
        None => line.trim(),
    }
}

fn parse_symbol_operand(module: &Module, tok: &str) -> Option<Operand> {
    let name = tok.strip_prefix('@')?;
    if let Some(g) = module.global_id(name) {
        return Some(Operand::Global(g));
    }
    module.func_id(name).map(Operand::Func)
}

fn parse_operand(module: &Module, tok: &str) -> Result<Operand, String> {
    let tok = tok.trim();
    if tok == "null" {
        return Ok(Operand::NullPtr);
    }
    if tok == "undef" {
        return Ok(Operand::Undef);
    }
    if let Some(name) = tok.strip_prefix('%') {
        let f = module
            .function(module_building_func(module))
            .local(name)
            .ok_or_else(|| format!("use of undefined local %{}", name))?;
        return Ok(Operand::Local(f));
    }
    parse_symbol_operand(module, tok).ok_or_else(|| format!("unknown symbol {}", tok))
}

fn parse_ty(tok: &str) -> Result<Ty, String> {
    match tok.trim() {
        "i1" => Ok(Ty::I1),
        "i8" => Ok(Ty::I8),
        "i16" => Ok(Ty::I16),
        "i32" => Ok(Ty::I32),
        "i64" => Ok(Ty::I64),
        "f32" => Ok(Ty::F32),
        "f64" => Ok(Ty::F64),
        "ptr" => Ok(Ty::Ptr),
        t => Err(format!("unknown type {}", t)),
    }
}

fn module_building_func(module: &Module) -> FuncId {
    module
        .building_function()
        .expect("Parsing a body line with no function being built")
}

fn fresh_local_checked(module: &mut Module, name: &str) -> Result<LocalId, String> {
    let f = module_building_func(module);
    if module.function(f).local(name).is_some() {
        return Err(format!(
            "local %{} redefined; the body is not in SSA form",
            name
        ));
    }
    Ok(module.fresh_local(name))
}

fn parse_call(module: &mut Module, dst: Option<&str>, expr: &str) -> Result<Insn, String> {
    let (callee, args) = expr
        .split_once('(')
        .ok_or_else(|| "malformed call".to_owned())?;
    let args = args
        .trim()
        .strip_suffix(')')
        .ok_or_else(|| "malformed call argument list".to_owned())?;
    let callee = parse_operand(module, callee)?;
    let args: Vec<Operand> = args
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| parse_operand(module, a))
        .collect::<Result<_, _>>()?;
    let dst = match dst {
        Some(name) => Some(fresh_local_checked(module, name)?),
        None => None,
    };
    Ok(Insn::Call { dst, callee, args })
}

fn parse_body_line(module: &mut Module, line: &str) -> Result<(), String> {
    let insn = if let Some((lhs, rhs)) = line.split_once('=') {
        let dst_name = lhs
            .trim()
            .strip_prefix('%')
            .ok_or_else(|| "assignment target must be a local".to_owned())?
            .to_owned();
        let rhs = rhs.trim();
        if let Some(rest) = rhs.strip_prefix("alloca") {
            let size = parse_size(rest)?;
            let dst = fresh_local_checked(module, &dst_name)?;
            Insn::Alloca { dst, size }
        } else if let Some(rest) = rhs.strip_prefix("malloc") {
            let size = parse_size(rest)?;
            let dst = fresh_local_checked(module, &dst_name)?;
            Insn::HeapAlloc { dst, size }
        } else if let Some(rest) = rhs.strip_prefix("load ") {
            let (ptr, ty) = match rest.split_once(',') {
                Some((p, t)) => (p, parse_ty(t)?),
                None => (rest, Ty::Ptr),
            };
            let ptr = parse_operand(module, ptr)?;
            let dst = fresh_local_checked(module, &dst_name)?;
            Insn::Load { dst, ptr, ty }
        } else if let Some(rest) = rhs.strip_prefix("gep ") {
            let (base, off) = rest
                .split_once(',')
                .ok_or_else(|| "gep needs a base and an offset".to_owned())?;
            let base = parse_operand(module, base)?;
            let offset = match off.trim() {
                "?" => GepOffset::Unknown,
                n => GepOffset::Const(
                    n.parse()
                        .map_err(|_| format!("bad gep offset {}", n))?,
                ),
            };
            let dst = fresh_local_checked(module, &dst_name)?;
            Insn::Gep { dst, base, offset }
        } else if let Some(rest) = rhs.strip_prefix("cast ") {
            let src = parse_operand(module, rest)?;
            let dst = fresh_local_checked(module, &dst_name)?;
            Insn::Cast { dst, src }
        } else if rhs == "int2ptr" {
            let dst = fresh_local_checked(module, &dst_name)?;
            Insn::IntToPtr { dst }
        } else if let Some(rest) = rhs.strip_prefix("call ") {
            parse_call(module, Some(&dst_name), rest)?
        } else {
            return Err(format!("unrecognized instruction: {}", rhs));
        }
    } else if let Some(rest) = line.strip_prefix("store ") {
        let mut parts = rest.splitn(3, ',');
        let val = parts.next().unwrap();
        let ptr = parts
            .next()
            .ok_or_else(|| "store needs a value and a pointer".to_owned())?;
        let ty = match parts.next() {
            Some(t) => parse_ty(t)?,
            None => Ty::Ptr,
        };
        let val = parse_operand(module, val)?;
        let ptr = parse_operand(module, ptr)?;
        Insn::Store { val, ptr, ty }
    } else if let Some(rest) = line.strip_prefix("call ") {
        parse_call(module, None, rest)?
    } else if let Some(rest) = line.strip_prefix("ptr2int ") {
        let src = parse_operand(module, rest)?;
        Insn::PtrToInt { src }
    } else if line == "ret" {
        Insn::Ret { val: None }
    } else if let Some(rest) = line.strip_prefix("ret ") {
        let val = parse_operand(module, rest)?;
        Insn::Ret { val: Some(val) }
    } else {
        return Err(format!("unrecognized instruction: {}", line));
    };
    module.push(insn);
    Ok(())
}

fn parse_size(rest: &str) -> Result<usize, String> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Ok(8);
    }
    rest.parse().map_err(|_| format!("bad size {}", rest))
}
