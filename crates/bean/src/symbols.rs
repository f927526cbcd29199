//! Symbol tables: lexical scopes, free-variable promotion and module
//! symbols.
//!
//! Each function gets its own [`SymbolTable`] chained through `outer` at
//! function boundaries; inside a table, an ordered stack of [`BlockScope`]s
//! tracks `{}` nesting. Resolving a name across a function boundary promotes
//! the symbol into the inner table's free list, which is how closures learn
//! what to capture.

use ahash::AHashMap;

/// What a resolved name refers to and how reads/writes compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Global,
    Local,
    NativeFunction,
    /// A captured variable; `index` points into the closure's free list.
    Free,
    /// The name of the enclosing function itself (compiles to
    /// `CurrentFunction`, enabling recursion before the definition
    /// completes).
    Function,
    /// The implicit map-literal receiver (compiles to `GetThis`).
    This,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub index: u16,
    pub assignable: bool,
}

impl Symbol {
    fn new(name: impl Into<String>, kind: SymbolKind, index: u16, assignable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            index,
            assignable,
        }
    }
}

/// One `{}` level inside a function. `offset` is the index of the first slot
/// this scope allocates; slots above it belong to enclosing block scopes.
#[derive(Debug, Clone, Default)]
struct BlockScope {
    store: AHashMap<String, Symbol>,
    offset: u16,
    num_definitions: u16,
}

#[derive(Debug, Clone)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    block_scopes: Vec<BlockScope>,
    free_symbols: Vec<Symbol>,
    max_num_definitions: u16,
}

impl SymbolTable {
    /// A file-level (global) table. Builtin native functions are bound up
    /// front, in registry order.
    pub fn new_global(native_names: &[String]) -> Self {
        let mut table = Self {
            outer: None,
            block_scopes: vec![BlockScope::default()],
            free_symbols: Vec::new(),
            max_num_definitions: 0,
        };
        for (index, name) in native_names.iter().enumerate() {
            table.define_native_function(name, index as u16);
        }
        table
    }

    /// A function-level table enclosed in `outer`.
    pub fn new_enclosed(outer: Box<SymbolTable>) -> Self {
        Self {
            outer: Some(outer),
            block_scopes: vec![BlockScope::default()],
            free_symbols: Vec::new(),
            max_num_definitions: 0,
        }
    }

    /// Detaches and returns the enclosing table, consuming this one.
    pub fn into_outer(self) -> Option<Box<SymbolTable>> {
        self.outer
    }

    pub fn is_global_scope(&self) -> bool {
        self.outer.is_none()
    }

    pub fn is_top_block_scope(&self) -> bool {
        self.block_scopes.len() == 1
    }

    pub fn is_top_global_scope(&self) -> bool {
        self.is_global_scope() && self.is_top_block_scope()
    }

    pub fn max_num_definitions(&self) -> u16 {
        self.max_num_definitions
    }

    pub fn free_symbols(&self) -> &[Symbol] {
        &self.free_symbols
    }

    pub fn take_free_symbols(&mut self) -> Vec<Symbol> {
        std::mem::take(&mut self.free_symbols)
    }

    /// Defines a name in the top block scope. Returns `None` for the
    /// reserved name `this` and for module-qualified names (those are only
    /// ever injected by the importer).
    pub fn define(&mut self, name: &str, assignable: bool) -> Option<Symbol> {
        if name.contains(':') || name == "this" {
            return None;
        }
        let kind = if self.outer.is_none() {
            SymbolKind::Global
        } else {
            SymbolKind::Local
        };
        let index = self.next_symbol_index();
        let symbol = Symbol::new(name, kind, index, assignable);
        self.set_symbol(symbol.clone());
        let top = self.top_scope_mut();
        top.num_definitions += 1;
        let definitions = self.count_num_definitions();
        if definitions > self.max_num_definitions {
            self.max_num_definitions = definitions;
        }
        Some(symbol)
    }

    /// Binds a pre-numbered slot of the native-function registry.
    pub fn define_native_function(&mut self, name: &str, index: u16) -> Symbol {
        let symbol = Symbol::new(name, SymbolKind::NativeFunction, index, false);
        self.set_symbol(symbol.clone());
        symbol
    }

    /// Binds the enclosing function's own name.
    pub fn define_function_name(&mut self, name: &str, assignable: bool) -> Option<Symbol> {
        if name.contains(':') {
            return None;
        }
        let symbol = Symbol::new(name, SymbolKind::Function, 0, assignable);
        self.set_symbol(symbol.clone());
        Some(symbol)
    }

    /// Binds the implicit `this` receiver.
    pub fn define_this(&mut self) -> Symbol {
        let symbol = Symbol::new("this", SymbolKind::This, 0, false);
        self.set_symbol(symbol.clone());
        symbol
    }

    fn define_free(&mut self, original: &Symbol) -> Symbol {
        self.free_symbols.push(original.clone());
        let symbol = Symbol::new(
            original.name.clone(),
            SymbolKind::Free,
            (self.free_symbols.len() - 1) as u16,
            original.assignable,
        );
        self.set_symbol(symbol.clone());
        symbol
    }

    /// Resolves a name, walking block scopes innermost-first and then the
    /// `outer` chain. A hit that crosses a function boundary (other than
    /// globals and natives) is promoted into this table's free list; `this`
    /// is promoted even when found locally, so closures capture the
    /// receiver of the map literal they were created in.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        let mut found = None;
        for scope in self.block_scopes.iter().rev() {
            if let Some(symbol) = scope.store.get(name) {
                found = Some(symbol.clone());
                break;
            }
        }

        if let Some(symbol) = found {
            if symbol.kind == SymbolKind::This {
                return Some(self.define_free(&symbol));
            }
            return Some(symbol);
        }

        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(name)?;
        if matches!(symbol.kind, SymbolKind::Global | SymbolKind::NativeFunction) {
            return Some(symbol);
        }
        Some(self.define_free(&symbol))
    }

    /// Whether the top block scope already binds `name` (shadow detection
    /// and module re-injection both use this).
    pub fn is_defined_in_top_scope(&self, name: &str) -> bool {
        self.top_scope().store.contains_key(name)
    }

    /// Re-injects a module's global symbol into this table, keeping its
    /// original global index. Already-bound names are left alone.
    pub fn add_module_symbol(&mut self, symbol: &Symbol) {
        debug_assert_eq!(symbol.kind, SymbolKind::Global);
        if self.is_defined_in_top_scope(&symbol.name) {
            return;
        }
        self.set_symbol(symbol.clone());
    }

    pub fn push_block_scope(&mut self) {
        let offset = self.count_num_definitions();
        self.block_scopes.push(BlockScope {
            store: AHashMap::new(),
            offset,
            num_definitions: 0,
        });
    }

    pub fn pop_block_scope(&mut self) {
        self.block_scopes.pop();
    }

    /// Global-slot offset bookkeeping used when entering an imported file's
    /// scope: the fresh table starts allocating after the importer's slots.
    pub fn next_top_scope_index(&self) -> u16 {
        let top = self.top_scope();
        top.offset + top.num_definitions
    }

    pub fn set_top_scope_offset(&mut self, offset: u16) {
        self.top_scope_mut().offset = offset;
    }

    pub fn top_scope_num_definitions(&self) -> u16 {
        self.top_scope().num_definitions
    }

    /// Absorbs the globals a popped file scope defined, so the next import
    /// keeps allocating fresh slots.
    pub fn absorb_definitions(&mut self, count: u16) {
        self.top_scope_mut().num_definitions += count;
    }

    fn top_scope(&self) -> &BlockScope {
        self.block_scopes.last().expect("symbol table has no block scope")
    }

    fn top_scope_mut(&mut self) -> &mut BlockScope {
        self.block_scopes
            .last_mut()
            .expect("symbol table has no block scope")
    }

    fn set_symbol(&mut self, symbol: Symbol) {
        self.top_scope_mut().store.insert(symbol.name.clone(), symbol);
    }

    fn next_symbol_index(&self) -> u16 {
        let top = self.top_scope();
        top.offset + top.num_definitions
    }

    fn count_num_definitions(&self) -> u16 {
        self.block_scopes.iter().map(|s| s.num_definitions).sum()
    }
}
