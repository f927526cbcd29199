//! The compiler: lowers the AST to bytecode.
//!
//! One `CodeBuilder` per compilation scope (function nesting), one
//! `SymbolTable` chain per file scope, and parallel stacks for break and
//! continue targets and for the source position attached to emitted bytes.
//! Imports recursively compile module files into fresh file scopes and cache
//! the result by canonical path.

use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    ast::{Block, Expr, ExprKind, FnLit, Operator, Stmt, StmtKind},
    bytecode::{CodeBuilder, CompilationUnit, Opcode},
    error::Errors,
    heap::{Heap, ScriptFunction},
    io::FileReadFn,
    parser::Parser,
    position::{CompiledFile, Position},
    symbols::{Symbol, SymbolKind, SymbolTable},
    value::Value,
};

/// Source file extension appended to import paths.
const MODULE_EXTENSION: &str = ".bn";

/// A module compiled once and cached by canonical path. Its globals are
/// re-exported to importers under `name::symbol`.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    symbols: Vec<Symbol>,
}

impl Module {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: Vec::new(),
        }
    }

    fn add_symbol(&mut self, symbol: &Symbol) {
        self.symbols.push(Symbol {
            name: format!("{}::{}", self.name, symbol.name),
            kind: SymbolKind::Global,
            index: symbol.index,
            assignable: false,
        });
    }
}

struct FileScope {
    file: Rc<CompiledFile>,
    symbol_table: Option<Box<SymbolTable>>,
    module: Option<Module>,
    loaded_module_names: Vec<String>,
}

/// Engine-owned state the compiler borrows for the duration of one compile.
pub struct CompileEnv<'a> {
    pub heap: &'a mut Heap,
    pub repl_mode: bool,
    pub file_read: &'a mut Option<Box<FileReadFn>>,
}

pub struct Compiler {
    constants: Vec<Value>,
    scopes: Vec<CodeBuilder>,
    file_scopes: Vec<FileScope>,
    modules: AHashMap<String, Module>,
    native_names: Vec<String>,
    errors: Errors,
    break_ips: Vec<usize>,
    continue_ips: Vec<usize>,
    src_positions: Vec<Position>,
}

impl Compiler {
    pub fn new(native_names: Vec<String>, errors: Errors) -> Self {
        let mut compiler = Self {
            constants: Vec::new(),
            scopes: vec![CodeBuilder::new()],
            file_scopes: Vec::new(),
            modules: AHashMap::new(),
            native_names,
            errors,
            break_ips: Vec::new(),
            continue_ips: Vec::new(),
            src_positions: Vec::new(),
        };
        compiler.push_file_scope(CompiledFile::new("none", ""), None);
        compiler
    }

    /// Compiles anonymous source (REPL input, `execute` strings).
    pub fn compile(&mut self, env: &mut CompileEnv<'_>, code: &str) -> Option<Rc<CompilationUnit>> {
        self.compile_source(env, code, "none")
    }

    /// Reads and compiles a file through the configured read callback.
    pub fn compile_file(
        &mut self,
        env: &mut CompileEnv<'_>,
        path: &str,
    ) -> Option<Rc<CompilationUnit>> {
        if env.file_read.is_none() {
            self.errors.add_compilation(
                Position::invalid(),
                "File read function not configured",
            );
            return None;
        }
        let code = env.file_read.as_mut().and_then(|read| read(path));
        let Some(code) = code else {
            self.errors.add_compilation(
                Position::invalid(),
                format!("Reading file \"{path}\" failed"),
            );
            return None;
        };
        self.compile_source(env, &code, path)
    }

    fn compile_source(
        &mut self,
        env: &mut CompileEnv<'_>,
        code: &str,
        path: &str,
    ) -> Option<Rc<CompilationUnit>> {
        self.src_positions.clear();
        self.break_ips.clear();
        self.continue_ips.clear();
        self.scopes = vec![CodeBuilder::new()];
        self.file_scopes[0].file = CompiledFile::new(path, code);

        // snapshot for rollback so a failed compile leaves the engine usable
        let snapshot = self
            .file_scopes
            .last()
            .and_then(|fs| fs.symbol_table.clone());

        let ok = self.compile_code(env, code).is_some();
        self.scopes.truncate(1);

        if !ok {
            while self.file_scopes.len() > 1 {
                self.pop_file_scope();
            }
            if let Some(fs) = self.file_scopes.last_mut() {
                fs.symbol_table = snapshot;
            }
            return None;
        }

        let builder = std::mem::take(&mut self.scopes[0]);
        Some(Rc::new(builder.build()))
    }

    fn compile_code(&mut self, env: &mut CompileEnv<'_>, code: &str) -> Option<()> {
        let file = self.file_scopes.last().map(|fs| fs.file.clone());
        let parser = Parser::new(code, file, env.repl_mode, self.errors.clone());
        let statements = parser.parse_all()?;
        self.compile_statements(env, &statements)
    }

    fn compile_statements(&mut self, env: &mut CompileEnv<'_>, statements: &[Stmt]) -> Option<()> {
        for stmt in statements {
            self.compile_statement(env, stmt)?;
        }
        Some(())
    }

    // ----- statements -----

    fn compile_statement(&mut self, env: &mut CompileEnv<'_>, stmt: &Stmt) -> Option<()> {
        self.src_positions.push(stmt.position.clone());
        let result = self.compile_statement_inner(env, stmt);
        self.src_positions.pop();
        result
    }

    fn compile_statement_inner(&mut self, env: &mut CompileEnv<'_>, stmt: &Stmt) -> Option<()> {
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expression(env, expr)?;
                self.emit(Opcode::Pop);
            }
            StmtKind::Define {
                name,
                value,
                assignable,
            } => {
                self.compile_expression(env, value)?;
                let symbol =
                    self.define_symbol(&name.position, &name.name, *assignable, false)?;
                if symbol.kind == SymbolKind::Global
                    && let Some(fs) = self.file_scopes.last_mut()
                    && let Some(module) = &mut fs.module
                {
                    module.add_symbol(&symbol);
                }
                self.write_symbol(&symbol, true);
            }
            StmtKind::If { cases, alternative } => {
                let mut jump_to_end_ips = Vec::with_capacity(cases.len());
                for case in cases {
                    self.compile_expression(env, &case.test)?;
                    let next_case_jump_ip = self.emit_jump(Opcode::JumpIfFalse);
                    self.compile_code_block(env, &case.consequence)?;
                    jump_to_end_ips.push(self.emit_jump(Opcode::Jump));
                    let after_case_ip = self.ip();
                    self.patch(next_case_jump_ip, after_case_ip);
                }
                if let Some(alternative) = alternative {
                    self.compile_code_block(env, alternative)?;
                }
                let end_ip = self.ip();
                for jump_ip in jump_to_end_ips {
                    self.patch(jump_ip, end_ip);
                }
            }
            StmtKind::Return(value) => {
                if self.scopes.len() == 1 {
                    self.errors
                        .add_compilation(stmt.position.clone(), "Nothing to return from");
                    return None;
                }
                match value {
                    Some(expr) => {
                        self.compile_expression(env, expr)?;
                        self.emit(Opcode::ReturnValue);
                    }
                    None => {
                        self.emit(Opcode::Return);
                    }
                }
            }
            StmtKind::While { test, body } => {
                let before_test_ip = self.ip();
                self.compile_expression(env, test)?;
                let after_test_ip = self.ip();
                self.emit_u16(Opcode::JumpIfTrue, (after_test_ip + 6) as u16);
                let jump_to_after_body_ip = self.emit_jump(Opcode::Jump);

                self.continue_ips.push(before_test_ip);
                self.break_ips.push(jump_to_after_body_ip);
                self.compile_code_block(env, body)?;
                self.break_ips.pop();
                self.continue_ips.pop();

                self.emit_u16(Opcode::Jump, before_test_ip as u16);
                let after_body_ip = self.ip();
                self.patch(jump_to_after_body_ip, after_body_ip);
            }
            StmtKind::Break => {
                let Some(break_ip) = self.break_ips.last().copied() else {
                    self.errors
                        .add_compilation(stmt.position.clone(), "Nothing to break from.");
                    return None;
                };
                self.emit_u16(Opcode::Jump, break_ip as u16);
            }
            StmtKind::Continue => {
                let Some(continue_ip) = self.continue_ips.last().copied() else {
                    self.errors
                        .add_compilation(stmt.position.clone(), "Nothing to continue from.");
                    return None;
                };
                self.emit_u16(Opcode::Jump, continue_ip as u16);
            }
            StmtKind::Foreach {
                iterator,
                source,
                body,
            } => {
                self.compile_foreach(env, stmt, iterator, source, body)?;
            }
            StmtKind::ForLoop {
                init,
                test,
                update,
                body,
            } => {
                self.compile_for_loop(env, init.as_deref(), test.as_ref(), update.as_ref(), body)?;
            }
            StmtKind::Block(block) => {
                self.compile_code_block(env, block)?;
            }
            StmtKind::Import { path } => {
                self.import_module(env, &stmt.position, path)?;
            }
            StmtKind::Recover { error_ident, body } => {
                if self.table_mut().is_global_scope() {
                    self.errors.add_compilation(
                        stmt.position.clone(),
                        "Recover statement cannot be defined in global scope",
                    );
                    return None;
                }
                if !self.table_mut().is_top_block_scope() {
                    self.errors.add_compilation(
                        stmt.position.clone(),
                        "Recover statement cannot be defined within other statements",
                    );
                    return None;
                }

                let recover_ip = self.emit_jump(Opcode::SetRecover);
                let jump_to_after_recover_ip = self.emit_jump(Opcode::Jump);
                let recover_target = self.ip();
                self.patch(recover_ip, recover_target);

                self.table_mut().push_block_scope();
                let error_symbol =
                    self.define_symbol(&error_ident.position, &error_ident.name, false, false)?;
                self.write_symbol(&error_symbol, true);
                self.compile_code_block(env, body)?;

                if !matches!(
                    self.builder().last_opcode(),
                    Some(Opcode::Return | Opcode::ReturnValue)
                ) {
                    self.errors.add_compilation(
                        stmt.position.clone(),
                        "Recover body must end with a return statement",
                    );
                    return None;
                }

                self.table_mut().pop_block_scope();
                let after_recover_ip = self.ip();
                self.patch(jump_to_after_recover_ip, after_recover_ip);
            }
        }
        Some(())
    }

    fn compile_foreach(
        &mut self,
        env: &mut CompileEnv<'_>,
        stmt: &Stmt,
        iterator: &crate::ast::Ident,
        source: &Expr,
        body: &Block,
    ) -> Option<()> {
        self.table_mut().push_block_scope();

        // init: hidden index, plus a hidden source slot unless the source is
        // already a plain identifier
        let index_symbol = self.define_symbol(&stmt.position, "@i", false, true)?;
        self.emit_u64(Opcode::Number, 0.0_f64.to_bits());
        self.write_symbol(&index_symbol, true);

        let source_symbol = if let ExprKind::Ident(name) = &source.kind {
            let Some(symbol) = self.table_mut().resolve(name) else {
                self.errors.add_compilation(
                    source.position.clone(),
                    format!("Symbol \"{name}\" could not be resolved"),
                );
                return None;
            };
            symbol
        } else {
            self.compile_expression(env, source)?;
            let symbol = self.define_symbol(&source.position, "@source", false, true)?;
            self.write_symbol(&symbol, true);
            symbol
        };

        // update
        let jump_to_after_update_ip = self.emit_jump(Opcode::Jump);
        let update_ip = self.ip();
        self.read_symbol(&index_symbol);
        self.emit_u64(Opcode::Number, 1.0_f64.to_bits());
        self.emit(Opcode::Add);
        self.write_symbol(&index_symbol, false);
        let after_update_ip = self.ip();
        self.patch(jump_to_after_update_ip, after_update_ip);

        // test: exit once the index reaches the source's length
        self.src_positions.push(source.position.clone());
        self.read_symbol(&source_symbol);
        self.emit(Opcode::Len);
        self.src_positions.pop();
        self.read_symbol(&index_symbol);
        self.emit(Opcode::Compare);
        self.emit(Opcode::Equal);

        let after_test_ip = self.ip();
        self.emit_u16(Opcode::JumpIfFalse, (after_test_ip + 6) as u16);
        let jump_to_after_body_ip = self.emit_jump(Opcode::Jump);

        self.read_symbol(&source_symbol);
        self.read_symbol(&index_symbol);
        self.emit(Opcode::GetValueAt);

        let iter_symbol = self.define_symbol(&iterator.position, &iterator.name, false, false)?;
        self.write_symbol(&iter_symbol, true);

        // body
        self.continue_ips.push(update_ip);
        self.break_ips.push(jump_to_after_body_ip);
        self.compile_code_block(env, body)?;
        self.break_ips.pop();
        self.continue_ips.pop();
        self.emit_u16(Opcode::Jump, update_ip as u16);

        let after_body_ip = self.ip();
        self.patch(jump_to_after_body_ip, after_body_ip);

        self.table_mut().pop_block_scope();
        Some(())
    }

    fn compile_for_loop(
        &mut self,
        env: &mut CompileEnv<'_>,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Block,
    ) -> Option<()> {
        self.table_mut().push_block_scope();

        if let Some(init) = init {
            self.compile_statement(env, init)?;
        }
        let jump_to_after_update_ip = self.emit_jump(Opcode::Jump);

        // update
        let update_ip = self.ip();
        if let Some(update) = update {
            self.compile_expression(env, update)?;
            self.emit(Opcode::Pop);
        }
        let after_update_ip = self.ip();
        self.patch(jump_to_after_update_ip, after_update_ip);

        // test
        match test {
            Some(test) => self.compile_expression(env, test)?,
            None => {
                self.emit(Opcode::True);
            }
        }
        let after_test_ip = self.ip();
        self.emit_u16(Opcode::JumpIfTrue, (after_test_ip + 6) as u16);
        let jump_to_after_body_ip = self.emit_jump(Opcode::Jump);

        // body
        self.continue_ips.push(update_ip);
        self.break_ips.push(jump_to_after_body_ip);
        self.compile_code_block(env, body)?;
        self.break_ips.pop();
        self.continue_ips.pop();
        self.emit_u16(Opcode::Jump, update_ip as u16);

        let after_body_ip = self.ip();
        self.patch(jump_to_after_body_ip, after_body_ip);

        self.table_mut().pop_block_scope();
        Some(())
    }

    fn compile_code_block(&mut self, env: &mut CompileEnv<'_>, block: &Block) -> Option<()> {
        self.table_mut().push_block_scope();
        if block.statements.is_empty() {
            self.emit(Opcode::Null);
            self.emit(Opcode::Pop);
        }
        for stmt in &block.statements {
            self.compile_statement(env, stmt)?;
        }
        self.table_mut().pop_block_scope();
        Some(())
    }

    // ----- expressions -----

    fn compile_expression(&mut self, env: &mut CompileEnv<'_>, expr: &Expr) -> Option<()> {
        self.src_positions.push(expr.position.clone());
        let result = self.compile_expression_inner(env, expr);
        self.src_positions.pop();
        result
    }

    fn compile_expression_inner(&mut self, env: &mut CompileEnv<'_>, expr: &Expr) -> Option<()> {
        match &expr.kind {
            ExprKind::Infix { op, left, right } => {
                let (opcode, rearrange) = match op {
                    Operator::Plus => (Opcode::Add, false),
                    Operator::Minus => (Opcode::Sub, false),
                    Operator::Asterisk => (Opcode::Mul, false),
                    Operator::Slash => (Opcode::Div, false),
                    Operator::Modulus => (Opcode::Mod, false),
                    Operator::Eq => (Opcode::Equal, false),
                    Operator::NotEq => (Opcode::NotEqual, false),
                    Operator::Gt => (Opcode::GreaterThan, false),
                    Operator::Gte => (Opcode::GreaterThanEqual, false),
                    // `a < b` runs as `b > a`
                    Operator::Lt => (Opcode::GreaterThan, true),
                    Operator::Lte => (Opcode::GreaterThanEqual, true),
                    Operator::BitOr => (Opcode::Or, false),
                    Operator::BitXor => (Opcode::Xor, false),
                    Operator::BitAnd => (Opcode::And, false),
                    Operator::Lshift => (Opcode::Lshift, false),
                    Operator::Rshift => (Opcode::Rshift, false),
                    _ => {
                        self.errors
                            .add_compilation(expr.position.clone(), "Unknown infix operator");
                        return None;
                    }
                };

                let (first, second) = if rearrange {
                    (right, left)
                } else {
                    (left, right)
                };
                self.compile_expression(env, first)?;
                self.compile_expression(env, second)?;

                if is_comparison(*op) {
                    self.emit(Opcode::Compare);
                }
                self.emit(opcode);
            }
            ExprKind::NumberLit(n) => {
                self.emit_u64(Opcode::Number, n.to_bits());
            }
            ExprKind::StringLit(s) => {
                let value = env.heap.alloc_string(s.as_str());
                let constant_ix = self.add_constant(value);
                self.emit_u16(Opcode::Constant, constant_ix);
            }
            ExprKind::NullLit => {
                self.emit(Opcode::Null);
            }
            ExprKind::BoolLit(b) => {
                self.emit(if *b { Opcode::True } else { Opcode::False });
            }
            ExprKind::ArrayLit(items) => {
                for item in items {
                    self.compile_expression(env, item)?;
                }
                self.emit_u16(Opcode::Array, items.len() as u16);
            }
            ExprKind::MapLit { keys, values } => {
                let count = (keys.len() * 2) as u16;
                self.emit_u16(Opcode::MapStart, count);
                for (key, value) in keys.iter().zip(values) {
                    self.compile_expression(env, key)?;
                    self.compile_expression(env, value)?;
                }
                self.emit_u16(Opcode::MapEnd, count);
            }
            ExprKind::Prefix { op, right } => {
                self.compile_expression(env, right)?;
                let opcode = match op {
                    Operator::Minus => Opcode::Minus,
                    Operator::Bang => Opcode::Bang,
                    _ => {
                        self.errors
                            .add_compilation(expr.position.clone(), "Unknown prefix operator.");
                        return None;
                    }
                };
                self.emit(opcode);
            }
            ExprKind::Ident(name) => {
                let Some(symbol) = self.table_mut().resolve(name) else {
                    self.errors.add_compilation(
                        expr.position.clone(),
                        format!("Symbol \"{name}\" could not be resolved"),
                    );
                    return None;
                };
                self.read_symbol(&symbol);
            }
            ExprKind::Index { left, index } => {
                self.compile_expression(env, left)?;
                self.compile_expression(env, index)?;
                self.emit(Opcode::GetIndex);
            }
            ExprKind::FnLit(fn_lit) => {
                self.compile_function_literal(env, expr, fn_lit)?;
            }
            ExprKind::Call { function, args } => {
                self.compile_expression(env, function)?;
                for arg in args {
                    self.compile_expression(env, arg)?;
                }
                self.emit_u8(Opcode::Call, args.len() as u8);
            }
            ExprKind::Assign { dest, source } => {
                if !matches!(dest.kind, ExprKind::Ident(_) | ExprKind::Index { .. }) {
                    self.errors
                        .add_compilation(dest.position.clone(), "Expression is not assignable.");
                    return None;
                }

                self.compile_expression(env, source)?;
                // assignment is an expression; its value stays on the stack
                self.emit(Opcode::Dup);

                self.src_positions.push(dest.position.clone());
                let result = self.compile_assignment_target(env, dest);
                self.src_positions.pop();
                result?;
            }
            ExprKind::Logical { op, left, right } => {
                self.compile_expression(env, left)?;
                self.emit(Opcode::Dup);
                let jump_ip = if *op == Operator::LogicalAnd {
                    self.emit_jump(Opcode::JumpIfFalse)
                } else {
                    self.emit_jump(Opcode::JumpIfTrue)
                };
                self.emit(Opcode::Pop);
                self.compile_expression(env, right)?;
                let after_right_ip = self.ip();
                self.patch(jump_ip, after_right_ip);
            }
        }
        Some(())
    }

    fn compile_assignment_target(&mut self, env: &mut CompileEnv<'_>, dest: &Expr) -> Option<()> {
        match &dest.kind {
            ExprKind::Ident(name) => {
                let Some(symbol) = self.table_mut().resolve(name) else {
                    self.errors.add_compilation(
                        dest.position.clone(),
                        format!("Symbol \"{name}\" could not be resolved"),
                    );
                    return None;
                };
                if !symbol.assignable {
                    self.errors.add_compilation(
                        dest.position.clone(),
                        format!("Symbol \"{name}\" is not assignable"),
                    );
                    return None;
                }
                self.write_symbol(&symbol, false);
            }
            ExprKind::Index { left, index } => {
                self.compile_expression(env, left)?;
                self.compile_expression(env, index)?;
                self.emit(Opcode::SetIndex);
            }
            _ => unreachable!("assignment target checked by caller"),
        }
        Some(())
    }

    fn compile_function_literal(
        &mut self,
        env: &mut CompileEnv<'_>,
        expr: &Expr,
        fn_lit: &FnLit,
    ) -> Option<()> {
        self.scopes.push(CodeBuilder::new());
        self.push_symbol_table();

        if let Some(name) = &fn_lit.name
            && self.table_mut().define_function_name(name, false).is_none()
        {
            self.errors.add_compilation(
                expr.position.clone(),
                format!("Cannot define symbol \"{name}\""),
            );
            return None;
        }

        self.table_mut().define_this();

        for param in &fn_lit.params {
            self.define_symbol(&param.position, &param.name, true, false)?;
        }

        self.compile_statements(env, &fn_lit.body.statements)?;

        if !matches!(
            self.builder().last_opcode(),
            Some(Opcode::Return | Opcode::ReturnValue)
        ) {
            self.emit(Opcode::Return);
        }

        let free_symbols = self.table_mut().take_free_symbols();
        let num_locals = self.table_mut().max_num_definitions();

        let builder = self.scopes.pop().expect("function compilation scope");
        self.pop_symbol_table();

        let unit = Rc::new(builder.build());
        let prototype = env.heap.alloc_function(ScriptFunction {
            name: fn_lit.name.as_deref().map(Rc::from),
            unit,
            num_locals,
            num_args: fn_lit.params.len() as u8,
            free: SmallVec::new(),
        });

        // the enclosing scope pushes each capture (locals as shared cells,
        // so assignments propagate), then Function bundles them into the
        // closure
        for symbol in &free_symbols {
            self.capture_symbol(symbol);
        }
        let constant_ix = self.add_constant(prototype);
        self.emit_u16_u8(Opcode::Function, constant_ix, free_symbols.len() as u8);
        Some(())
    }

    // ----- modules -----

    fn import_module(
        &mut self,
        env: &mut CompileEnv<'_>,
        position: &Position,
        module_path: &str,
    ) -> Option<()> {
        let module_name = module_name_of(module_path).to_owned();

        let already_loaded = self
            .file_scopes
            .last()
            .is_some_and(|fs| fs.loaded_module_names.iter().any(|n| *n == module_name));
        if already_loaded {
            self.errors.add_compilation(
                position.clone(),
                format!("Module \"{module_name}\" was already imported"),
            );
            return None;
        }

        let filepath = if module_path.starts_with('/') {
            format!("{module_path}{MODULE_EXTENSION}")
        } else {
            let dir = self
                .file_scopes
                .last()
                .map(|fs| fs.file.dir_path.clone())
                .unwrap_or_default();
            format!("{dir}{module_path}{MODULE_EXTENSION}")
        };
        let filepath = canonicalise_path(&filepath);

        if !self.table_mut().is_top_global_scope() {
            self.errors.add_compilation(
                position.clone(),
                "Modules can only be imported in global scope",
            );
            return None;
        }

        if self.file_scopes.iter().any(|fs| fs.file.path == filepath) {
            self.errors.add_compilation(
                position.clone(),
                format!("Cyclic reference of file \"{filepath}\""),
            );
            return None;
        }

        let module = if let Some(module) = self.modules.get(&filepath) {
            module.clone()
        } else {
            if env.file_read.is_none() {
                self.errors.add_compilation(
                    position.clone(),
                    format!(
                        "Cannot import module \"{filepath}\", file read function not configured"
                    ),
                );
                return None;
            }
            let code = env.file_read.as_mut().and_then(|read| read(&filepath));
            let Some(code) = code else {
                self.errors.add_compilation(
                    position.clone(),
                    format!("Reading module file \"{filepath}\" failed"),
                );
                return None;
            };

            let file = CompiledFile::new(&filepath, &code);
            self.push_file_scope(file, Some(Module::new(&module_name)));
            let ok = self.compile_code(env, &code).is_some();
            let module = self.pop_file_scope();
            if !ok {
                return None;
            }
            let module = module.expect("imported file scope carries a module");
            self.modules.insert(filepath, module.clone());
            module
        };

        for symbol in &module.symbols {
            self.table_mut().add_module_symbol(symbol);
        }
        if let Some(fs) = self.file_scopes.last_mut() {
            fs.loaded_module_names.push(module_name);
        }
        Some(())
    }

    fn push_file_scope(&mut self, file: Rc<CompiledFile>, module: Option<Module>) {
        let prev_offset = self
            .file_scopes
            .last()
            .and_then(|fs| fs.symbol_table.as_ref())
            .map(|table| table.next_top_scope_index());

        self.file_scopes.push(FileScope {
            file,
            symbol_table: None,
            module,
            loaded_module_names: Vec::new(),
        });
        self.push_symbol_table();

        // globals of this file start after the importer's, so the slots of
        // separately compiled files never collide
        if let Some(offset) = prev_offset {
            self.table_mut().set_top_scope_offset(offset);
        }
    }

    fn pop_file_scope(&mut self) -> Option<Module> {
        let popped_definitions = self
            .file_scopes
            .last()
            .and_then(|fs| fs.symbol_table.as_ref())
            .map_or(0, |table| table.top_scope_num_definitions());

        let scope = self.file_scopes.pop()?;

        if let Some(fs) = self.file_scopes.last_mut()
            && let Some(table) = fs.symbol_table.as_mut()
        {
            table.absorb_definitions(popped_definitions);
        }
        scope.module
    }

    fn push_symbol_table(&mut self) {
        let fs = self
            .file_scopes
            .last_mut()
            .expect("compiler has no file scope");
        let table = match fs.symbol_table.take() {
            Some(outer) => SymbolTable::new_enclosed(outer),
            None => SymbolTable::new_global(&self.native_names),
        };
        fs.symbol_table = Some(Box::new(table));
    }

    fn pop_symbol_table(&mut self) {
        let fs = self
            .file_scopes
            .last_mut()
            .expect("compiler has no file scope");
        fs.symbol_table = fs.symbol_table.take().and_then(|t| t.into_outer());
    }

    // ----- helpers -----

    /// The symbol table of the innermost file scope.
    pub fn table_mut(&mut self) -> &mut SymbolTable {
        self.file_scopes
            .last_mut()
            .and_then(|fs| fs.symbol_table.as_deref_mut())
            .expect("compiler has no symbol table")
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Binds a host-registered native function in the current global scope.
    pub fn define_native(&mut self, name: &str, index: u16) {
        self.table_mut().define_native_function(name, index);
    }

    fn define_symbol(
        &mut self,
        position: &Position,
        name: &str,
        assignable: bool,
        can_shadow: bool,
    ) -> Option<Symbol> {
        if !can_shadow
            && !self.table_mut().is_top_global_scope()
            && self.table_mut().resolve(name).is_some()
        {
            self.errors.add_compilation(
                position.clone(),
                format!("Symbol \"{name}\" is already defined"),
            );
            return None;
        }
        let Some(symbol) = self.table_mut().define(name, assignable) else {
            self.errors.add_compilation(
                position.clone(),
                format!("Cannot define symbol \"{name}\""),
            );
            return None;
        };
        Some(symbol)
    }

    /// Pushes a value for closure capture. Locals and transitive captures
    /// go through shared cells; `this` and self-references are plain values
    /// (they are not assignable, so nothing needs to propagate).
    fn capture_symbol(&mut self, symbol: &Symbol) {
        match symbol.kind {
            SymbolKind::Local => {
                self.emit_u8(Opcode::CaptureLocal, symbol.index as u8);
            }
            SymbolKind::Free => {
                self.emit_u8(Opcode::CaptureFree, symbol.index as u8);
            }
            _ => self.read_symbol(symbol),
        }
    }

    fn read_symbol(&mut self, symbol: &Symbol) {
        match symbol.kind {
            SymbolKind::Global => {
                self.emit_u16(Opcode::GetGlobal, symbol.index);
            }
            SymbolKind::NativeFunction => {
                self.emit_u16(Opcode::GetNativeFunction, symbol.index);
            }
            SymbolKind::Local => {
                self.emit_u8(Opcode::GetLocal, symbol.index as u8);
            }
            SymbolKind::Free => {
                self.emit_u8(Opcode::GetFree, symbol.index as u8);
            }
            SymbolKind::Function => {
                self.emit(Opcode::CurrentFunction);
            }
            SymbolKind::This => {
                self.emit(Opcode::GetThis);
            }
        }
    }

    fn write_symbol(&mut self, symbol: &Symbol, define: bool) {
        match symbol.kind {
            SymbolKind::Global => {
                let op = if define {
                    Opcode::DefineGlobal
                } else {
                    Opcode::SetGlobal
                };
                self.emit_u16(op, symbol.index);
            }
            SymbolKind::Local => {
                let op = if define {
                    Opcode::DefineLocal
                } else {
                    Opcode::SetLocal
                };
                self.emit_u8(op, symbol.index as u8);
            }
            SymbolKind::Free => {
                self.emit_u8(Opcode::SetFree, symbol.index as u8);
            }
            SymbolKind::NativeFunction | SymbolKind::Function | SymbolKind::This => {}
        }
    }

    fn builder(&mut self) -> &mut CodeBuilder {
        self.scopes.last_mut().expect("compiler has no scope")
    }

    fn ip(&mut self) -> usize {
        self.builder().ip()
    }

    fn position(&self) -> Position {
        self.src_positions
            .last()
            .cloned()
            .unwrap_or_else(Position::invalid)
    }

    fn emit(&mut self, op: Opcode) -> usize {
        let position = self.position();
        self.builder().emit(op, &position)
    }

    fn emit_u8(&mut self, op: Opcode, operand: u8) -> usize {
        let position = self.position();
        self.builder().emit_u8(op, operand, &position)
    }

    fn emit_u16(&mut self, op: Opcode, operand: u16) -> usize {
        let position = self.position();
        self.builder().emit_u16(op, operand, &position)
    }

    fn emit_u64(&mut self, op: Opcode, operand: u64) -> usize {
        let position = self.position();
        self.builder().emit_u64(op, operand, &position)
    }

    fn emit_u16_u8(&mut self, op: Opcode, first: u16, second: u8) -> usize {
        let position = self.position();
        self.builder().emit_u16_u8(op, first, second, &position)
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        let position = self.position();
        self.builder().emit_jump(op, &position)
    }

    fn patch(&mut self, instruction_ip: usize, target: usize) {
        self.builder().patch_u16(instruction_ip, target as u16);
    }

    fn add_constant(&mut self, value: Value) -> u16 {
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }
}

fn is_comparison(op: Operator) -> bool {
    matches!(
        op,
        Operator::Eq
            | Operator::NotEq
            | Operator::Gt
            | Operator::Gte
            | Operator::Lt
            | Operator::Lte
    )
}

fn module_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Collapses `.` and `..` segments textually; no filesystem access.
fn canonicalise_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble;

    fn compile_ok(code: &str) -> String {
        let errors = Errors::new();
        let mut heap = Heap::new();
        let mut compiler = Compiler::new(vec![], errors.clone());
        let mut file_read: Option<Box<FileReadFn>> = None;
        let mut env = CompileEnv {
            heap: &mut heap,
            repl_mode: false,
            file_read: &mut file_read,
        };
        match compiler.compile(&mut env, code) {
            Some(unit) => disassemble(&unit),
            None => panic!(
                "compile failed: {:?}",
                errors.to_vec().iter().map(|e| e.message.clone()).collect::<Vec<_>>()
            ),
        }
    }

    fn compile_err(code: &str) -> String {
        let errors = Errors::new();
        let mut heap = Heap::new();
        let mut compiler = Compiler::new(vec![], errors.clone());
        let mut file_read: Option<Box<FileReadFn>> = None;
        let mut env = CompileEnv {
            heap: &mut heap,
            repl_mode: false,
            file_read: &mut file_read,
        };
        assert!(compiler.compile(&mut env, code).is_none(), "expected failure");
        errors
            .to_vec()
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_default()
    }

    #[test]
    fn define_compiles_to_number_and_define_global() {
        let listing = compile_ok("const x = 5");
        assert_eq!(listing, "0000 NUMBER 5\n0009 DEFINE_GLOBAL 0\n");
    }

    #[test]
    fn less_than_swaps_operands() {
        // `1 < 2` compiles `2`, `1`, COMPARE, GREATER_THAN
        let listing = compile_ok("const x = 1 < 2");
        assert_eq!(
            listing,
            "0000 NUMBER 2\n0009 NUMBER 1\n0018 COMPARE\n0019 GREATER_THAN\n0020 DEFINE_GLOBAL 0\n"
        );
    }

    #[test]
    fn logical_and_short_circuits() {
        let listing = compile_ok("const x = true && false");
        assert!(listing.contains("DUP"), "{listing}");
        assert!(listing.contains("JUMP_IF_FALSE"), "{listing}");
        assert!(!listing.contains("48879"), "unpatched jump: {listing}");
    }

    #[test]
    fn if_chain_patches_all_jumps() {
        let listing =
            compile_ok("var x = 0\nif (x == 1) { x = 1 } else if (x == 2) { x = 2 } else { x = 3 }");
        // 0xbeef = 48879 must never survive patching
        assert!(!listing.contains("48879"), "unpatched jump: {listing}");
        assert!(listing.matches("JUMP_IF_FALSE").count() == 2, "{listing}");
    }

    #[test]
    fn while_loop_shape() {
        let listing = compile_ok("var i = 0\nwhile (i < 3) { i = i + 1 }");
        assert!(listing.contains("JUMP_IF_TRUE"), "{listing}");
        assert!(!listing.contains("48879"), "{listing}");
        assert!(!listing.contains("57005"), "0xdead survived: {listing}");
    }

    #[test]
    fn foreach_synthesizes_hidden_locals() {
        let listing = compile_ok("const xs = [1]\nfor (x in xs) { var y = x }");
        assert!(listing.contains("LEN"), "{listing}");
        assert!(listing.contains("GET_VALUE_AT"), "{listing}");
        // source is a bare identifier, so no @source slot is defined; @i and
        // x and y occupy global slots 1..
        assert!(!listing.contains("48879"), "{listing}");
    }

    #[test]
    fn function_literal_builds_closure_prototype() {
        let listing = compile_ok("const f = fn(a, b) { return a + b }");
        assert!(listing.contains("FUNCTION 0 0"), "{listing}");
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        assert_eq!(compile_err("break"), "Nothing to break from.");
        assert_eq!(compile_err("continue"), "Nothing to continue from.");
    }

    #[test]
    fn return_outside_function_is_an_error() {
        assert_eq!(compile_err("return 1"), "Nothing to return from");
    }

    #[test]
    fn const_is_not_assignable() {
        let message = compile_err("const x = 1\nx = 2");
        assert_eq!(message, "Symbol \"x\" is not assignable");
    }

    #[test]
    fn unresolved_symbol_is_an_error() {
        let message = compile_err("const x = missing");
        assert_eq!(message, "Symbol \"missing\" could not be resolved");
    }

    #[test]
    fn duplicate_local_definition_is_an_error() {
        let message = compile_err("const f = fn() { var a = 1; var a = 2; return a }");
        assert_eq!(message, "Symbol \"a\" is already defined");
    }

    #[test]
    fn recover_is_rejected_in_global_scope() {
        let message = compile_err("recover (e) { return 1 }");
        assert_eq!(message, "Recover statement cannot be defined in global scope");
    }

    #[test]
    fn recover_requires_trailing_return() {
        let message = compile_err("const f = fn() { recover (e) { var x = 1 } return 2 }");
        assert_eq!(message, "Recover body must end with a return statement");
    }

    #[test]
    fn recover_must_be_in_top_block() {
        let message =
            compile_err("const f = fn() { if (true) { recover (e) { return 1 } } return 2 }");
        assert_eq!(
            message,
            "Recover statement cannot be defined within other statements"
        );
    }

    #[test]
    fn import_requires_read_callback() {
        let message = compile_err("import \"mod\"");
        assert!(message.contains("file read function not configured"), "{message}");
    }

    #[test]
    fn failed_compile_rolls_back_global_symbols() {
        let errors = Errors::new();
        let mut heap = Heap::new();
        let mut compiler = Compiler::new(vec![], errors.clone());
        let mut file_read: Option<Box<FileReadFn>> = None;
        let mut env = CompileEnv {
            heap: &mut heap,
            repl_mode: false,
            file_read: &mut file_read,
        };
        assert!(compiler.compile(&mut env, "const a = 1\nconst b = missing").is_none());
        errors.clear();
        // `a` was rolled back, so defining it again succeeds
        assert!(compiler.compile(&mut env, "const a = 2").is_some());
        assert!(errors.is_empty());
    }

    #[test]
    fn compiling_twice_produces_identical_bytecode() {
        let source = "const add = fn(a, b) { return a + b }\nvar total = add(1, 2)";
        let first = compile_ok(source);
        let second = compile_ok(source);
        assert_eq!(first, second);
    }

    #[test]
    fn canonicalise_collapses_dot_segments() {
        assert_eq!(canonicalise_path("a/b/../c.bn"), "a/c.bn");
        assert_eq!(canonicalise_path("./m.bn"), "m.bn");
        assert_eq!(canonicalise_path("/x/./y.bn"), "/x/y.bn");
        assert_eq!(module_name_of("a/b/c"), "c");
        assert_eq!(module_name_of("solo"), "solo");
    }
}
