//! The module linker.
//!
//! Given a parsed entry tree, the linker rewrites it in place so it
//! contains, in order: the standard library block (loaded at most once per
//! session), one synthetic module-wrapper definition per import resolved at
//! the top of the entry block, then the entry block's own statements.
//!
//! Every piece of linking state lives on the [`Linker`] session value:
//! independent compilations never see each other's file lists or import
//! stacks. The active-import stack follows a strict push-before-recurse /
//! pop-after-return discipline on every path, failure paths included, so
//! sibling imports always observe a correct chain.

use std::env;
use std::fs;
use std::path::{MAIN_SEPARATOR, PathBuf};

use nasal_core::{Diagnostics, LinkError, Phase, Span};
use nasal_syntax::ParseService;
use nasal_syntax::ast::{
    Block, CallExpr, CallInvoke, CallPart, DefTarget, DefinitionExpr, Expr, FunctionExpr,
    HashExpr, HashPair, Identifier, ReturnExpr,
};
use nasal_syntax::symbol_finder::find_symbols;

/// The extension importable module files must carry.
pub const REQUIRED_EXTENSION: &str = ".nas";

/// Reserved file name of the standard library.
pub const LIBRARY_FILE: &str = "lib.nas";

/// Subdirectory tried as a fallback when resolving the standard library.
pub const LIBRARY_DIR: &str = "std";

/// Environment variable supplying the module search path.
pub const SEARCH_PATH_VAR: &str = "PATH";

/// One linking session.
#[derive(Debug)]
pub struct Linker {
    /// Files fully imported so far; index is the file id, entry file first.
    files: Vec<String>,
    /// The active recursive-import chain, entry file at the bottom.
    load_stack: Vec<String>,
    /// Directories searched when resolving a module file.
    search_paths: Vec<PathBuf>,
    /// Resolved location of the standard library, once loaded.
    library_path: Option<String>,
    /// Whether the standard library has been spliced already.
    lib_loaded: bool,
    /// Whether resolution failures list every attempted path.
    show_path: bool,
}

impl Linker {
    /// Create a session whose search path is derived from the
    /// [`SEARCH_PATH_VAR`] environment variable.
    pub fn new() -> Self {
        let search_paths = env::var_os(SEARCH_PATH_VAR)
            .map(|raw| {
                env::split_paths(&raw)
                    .filter(|p| !p.as_os_str().is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self::with_search_paths(search_paths)
    }

    /// Create a session with an explicit search path, bypassing the
    /// environment. Embedders and tests use this.
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self {
            files: Vec::new(),
            load_stack: Vec::new(),
            search_paths,
            library_path: None,
            lib_loaded: false,
            show_path: false,
        }
    }

    /// Every file imported in this session, entry file first. Index order
    /// is the file-id space shared with the code generator.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Where the standard library was found, if it has been loaded.
    pub fn library_path(&self) -> Option<&str> {
        self.library_path.as_deref()
    }

    /// Link the tree currently held by `front`, which was parsed from
    /// `entry`. The tree is rewritten in place through the swap contract;
    /// inspect `diags` afterwards before trusting it.
    pub fn link(
        &mut self,
        front: &mut dyn ParseService,
        entry: &str,
        show_path: bool,
        diags: &mut Diagnostics,
    ) {
        self.show_path = show_path;
        self.files = vec![entry.to_string()];
        self.load_stack = vec![entry.to_string()];

        let root = front.swap(Block::default());
        let linked = self.load(root, 0, front, diags);
        front.swap(linked);
    }

    /// Build the linked block for one file: library first (entry file
    /// only), then a wrapper definition per leading import, then the
    /// file's own statements.
    fn load(
        &mut self,
        mut root: Block,
        index: u32,
        front: &mut dyn ParseService,
        diags: &mut Diagnostics,
    ) -> Block {
        let file = self.files[index as usize].clone();
        let mut tree = Block::empty(Span::synthesized(file));

        if !self.lib_loaded {
            self.lib_loaded = true;
            let mut library = self.import_library(front, diags);
            tree.splice_from(&mut library);
        }

        // Only the contiguous prefix of leading imports is linked; the scan
        // stops at the first non-import statement. Imports appearing later
        // in the block stay unresolved, which is a compatibility guarantee.
        for stmt in root.stmts.iter_mut() {
            if !is_import(stmt) {
                break;
            }
            let span = stmt.span().clone();
            let Expr::Call(call) = stmt.replace(Expr::null(span)) else {
                break;
            };
            if let Some(module) = self.import_regular_file(call, front, diags) {
                tree.push(self.module_definition(module, diags));
            }
        }

        tree.splice_from(&mut root);
        tree
    }

    /// Import one regular module. Returns `None` when the file was already
    /// fully imported in this session, in which case no wrapper definition
    /// may be generated.
    fn import_regular_file(
        &mut self,
        call: CallExpr,
        front: &mut dyn ParseService,
        diags: &mut Diagnostics,
    ) -> Option<Block> {
        let filename = import_path(&call);
        let location = call.span;

        let Some(path) = self.find_file(&filename, &location, diags) else {
            return Some(Block::empty(Span::synthesized("")));
        };

        if self.load_stack.contains(&path) {
            diags.fatal(
                Phase::Link,
                Some(location),
                LinkError::SelfImport {
                    name: path.clone(),
                    chain: self.import_chain(&path),
                },
            );
            return Some(Block::empty(Span::synthesized(path)));
        }

        let (index, already) = self.intern_file(&path);
        if already {
            return None;
        }

        self.load_stack.push(path.clone());
        let result = self.parse_module(&path, index, front, diags, false);
        self.load_stack.pop();
        Some(result)
    }

    /// Import the standard library, at most once per session.
    fn import_library(
        &mut self,
        front: &mut dyn ParseService,
        diags: &mut Diagnostics,
    ) -> Block {
        let entry = self.files.first().cloned().unwrap_or_default();
        let location = Span::synthesized(entry);

        let Some(path) = self.find_file(LIBRARY_FILE, &location, diags) else {
            return Block::empty(Span::synthesized(""));
        };
        self.library_path = Some(path.clone());

        let (index, already) = self.intern_file(&path);
        if already {
            return Block::empty(Span::synthesized(path));
        }
        self.parse_module(&path, index, front, diags, true)
    }

    /// Read, parse, and recursively load one resolved file. Failures leave
    /// a fatal diagnostic and yield an empty placeholder block so the rest
    /// of the compilation can still be checked.
    fn parse_module(
        &mut self,
        path: &str,
        index: u32,
        front: &mut dyn ParseService,
        diags: &mut Diagnostics,
        library: bool,
    ) -> Block {
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                diags.fatal(
                    Phase::Link,
                    None,
                    LinkError::UnreadableFile {
                        name: path.to_string(),
                        detail: err.to_string(),
                    },
                );
                return Block::empty(Span::synthesized(path));
            }
        };

        let fatals_before = diags.fatals().count();
        front.compile(&source, path, diags);
        if diags.fatals().count() > fatals_before {
            let err = if library {
                LinkError::LibraryAnalysis {
                    name: path.to_string(),
                }
            } else {
                LinkError::ModuleAnalysis {
                    name: path.to_string(),
                }
            };
            diags.fatal(Phase::Link, None, err);
            return Block::empty(Span::synthesized(path));
        }

        let tree = front.swap(Block::default());
        self.load(tree, index, front, diags)
    }

    /// Resolve `filename`: literally first, then against each search path,
    /// then (for the standard library only) one level under the fallback
    /// subdirectory. Failure is a fatal diagnostic whose verbosity depends
    /// on the show-path flag.
    fn find_file(
        &self,
        filename: &str,
        location: &Span,
        diags: &mut Diagnostics,
    ) -> Option<String> {
        let mut candidates = vec![PathBuf::from(filename)];
        for dir in &self.search_paths {
            candidates.push(dir.join(filename));
        }

        for candidate in &candidates {
            if candidate.exists() {
                return Some(candidate.to_string_lossy().into_owned());
            }
        }

        if filename == LIBRARY_FILE {
            let fallback = format!("{LIBRARY_DIR}{MAIN_SEPARATOR}{LIBRARY_FILE}");
            return self.find_file(&fallback, location, diags);
        }

        let err = if self.show_path {
            let mut paths = String::new();
            for candidate in &candidates {
                paths.push_str(&format!("  -> {}\n", candidate.display()));
            }
            LinkError::FileNotFoundDetail {
                file: location.file.to_string(),
                name: filename.to_string(),
                paths,
            }
        } else {
            LinkError::FileNotFound {
                file: location.file.to_string(),
                name: filename.to_string(),
            }
        };
        diags.fatal(Phase::Link, Some(location.clone()), err);
        None
    }

    /// Record `file`, returning its index and whether it was already
    /// present.
    fn intern_file(&mut self, file: &str) -> (u32, bool) {
        if let Some(pos) = self.files.iter().position(|f| f == file) {
            return (pos as u32, true);
        }
        self.files.push(file.to_string());
        ((self.files.len() - 1) as u32, false)
    }

    /// Render the active import chain ending in `file`, e.g.
    /// `[a.nas] -> [b.nas] -> [a.nas]`.
    fn import_chain(&self, file: &str) -> String {
        let mut chain = String::new();
        for entry in &self.load_stack {
            chain.push_str(&format!("[{}] -> ", entry));
        }
        chain.push_str(&format!("[{}]", file));
        chain
    }

    /// Wrap a module body into `var <name> = func() { ...; return {..} }()`.
    fn module_definition(&self, block: Block, diags: &mut Diagnostics) -> Expr {
        let path = block.span.file.to_string();
        let span = block.span.clone();
        let name = self.module_name(&path, diags);

        let mut body = block;
        let ret = module_return(&body);
        body.push(ret);

        let func = Expr::Func(FunctionExpr {
            params: Vec::new(),
            body,
            span: span.clone(),
        });
        let invoke = Expr::Call(CallExpr {
            first: Box::new(func),
            calls: vec![CallPart::Invoke(CallInvoke {
                args: Vec::new(),
                span: span.clone(),
            })],
            span: span.clone(),
        });

        Expr::Def(DefinitionExpr {
            target: DefTarget::Single(Identifier {
                name,
                span: span.clone(),
            }),
            value: Box::new(invoke),
            span,
        })
    }

    /// Derive the module identifier from a file path. Names that are
    /// empty, digit-leading, dotted, or missing the required extension are
    /// flagged as warnings and replaced by a synthetic fallback.
    fn module_name(&self, path: &str, diags: &mut Diagnostics) -> String {
        let fallback = format!("module@[{path}]");

        if !path.ends_with(REQUIRED_EXTENSION) {
            diags.warning(
                Phase::Link,
                None,
                LinkError::ModuleNameBadExtension { path: path.into() },
            );
            return fallback;
        }

        let stem = &path[..path.len() - REQUIRED_EXTENSION.len()];
        let name = stem.rsplit(['/', '\\']).next().unwrap_or("");

        if name.is_empty() {
            diags.warning(
                Phase::Link,
                None,
                LinkError::ModuleNameEmpty { path: path.into() },
            );
            return fallback;
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            diags.warning(
                Phase::Link,
                None,
                LinkError::ModuleNameLeadingDigit {
                    name: name.into(),
                    path: path.into(),
                },
            );
            return fallback;
        }
        if name.contains('.') {
            diags.warning(
                Phase::Link,
                None,
                LinkError::ModuleNameInnerSeparator {
                    name: name.into(),
                    path: path.into(),
                },
            );
            return fallback;
        }
        name.to_string()
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a statement is one of the two recognized import forms:
/// `import.a.b;` (dotted field chain) or `import("path");` (single string
/// argument).
pub fn is_import(stmt: &Expr) -> bool {
    let Expr::Call(call) = stmt else {
        return false;
    };
    let Expr::Id(id) = call.first.as_ref() else {
        return false;
    };
    if id.name != "import" || call.calls.is_empty() {
        return false;
    }

    // import.a.b; every postfix part must be a field access.
    if call
        .calls
        .iter()
        .all(|part| matches!(part, CallPart::Field(_)))
    {
        return true;
    }

    // import("path"); exactly one invocation with one literal string.
    if call.calls.len() != 1 {
        return false;
    }
    let CallPart::Invoke(invoke) = &call.calls[0] else {
        return false;
    };
    invoke.args.len() == 1 && matches!(invoke.args[0], Expr::Str(_))
}

/// Extract the requested path from a recognized import statement: the
/// string argument of the call form, or `./seg1/seg2....nas` built from the
/// dotted form.
fn import_path(call: &CallExpr) -> String {
    if let Some(CallPart::Invoke(invoke)) = call.calls.first() {
        if let Some(Expr::Str(path)) = invoke.args.first() {
            return path.value.clone();
        }
    }

    let mut path = String::from(".");
    for part in &call.calls {
        if let CallPart::Field(field) = part {
            path.push(MAIN_SEPARATOR);
            path.push_str(&field.field);
        }
    }
    path + REQUIRED_EXTENSION
}

/// Build the synthetic `return {name: name, ...}` exporting every top-level
/// binding of `block`, except names starting with `_`.
fn module_return(block: &Block) -> Expr {
    let span = block.span.clone();
    let mut members = Vec::new();
    for symbol in find_symbols(block) {
        if symbol.name.starts_with('_') {
            continue;
        }
        members.push(HashPair {
            value: Expr::Id(Identifier {
                name: symbol.name.clone(),
                span: span.clone(),
            }),
            name: symbol.name,
            span: span.clone(),
        });
    }
    Expr::Return(ReturnExpr {
        value: Some(Box::new(Expr::Hash(HashExpr {
            members,
            span: span.clone(),
        }))),
        span,
    })
}
