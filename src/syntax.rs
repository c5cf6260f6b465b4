use oxc::allocator::Allocator;
use oxc::diagnostics::OxcDiagnostic;
use oxc::parser::Parser;
use oxc::semantic::SemanticBuilder;
use oxc::span::SourceType;
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Parse-only check run before a script is stored.
///
/// Nothing is executed. Scripts are parsed as classic (non-module) scripts,
/// matching how the sandbox evaluates them.
#[derive(Debug, Clone)]
pub struct SyntaxValidator {
    max_script_size_bytes: usize,
}

impl SyntaxValidator {
    pub fn new(max_script_size_bytes: usize) -> Self {
        Self {
            max_script_size_bytes,
        }
    }

    pub fn validate(&self, name: &str, source: &str) -> AppResult<()> {
        if source.len() > self.max_script_size_bytes {
            return Err(AppError::validation(format!(
                "script '{}' is {} bytes, limit is {}",
                name,
                source.len(),
                self.max_script_size_bytes
            )));
        }

        let allocator = Allocator::default();
        let source_type = SourceType::default().with_script(true);
        let ret = Parser::new(&allocator, source, source_type).parse();

        if ret.panicked || !ret.errors.is_empty() {
            return Err(syntax_error(name, source, &ret.errors));
        }

        // Early errors (redeclared bindings, stray `break`) that the parser
        // leaves to semantic analysis but QuickJS rejects at compile time.
        let semantic = SemanticBuilder::new()
            .with_check_syntax_error(true)
            .build(&ret.program);
        if !semantic.errors.is_empty() {
            return Err(syntax_error(name, source, &semantic.errors));
        }

        Ok(())
    }
}

fn syntax_error(name: &str, source: &str, errors: &[OxcDiagnostic]) -> AppError {
    let details: Vec<String> = errors
        .iter()
        .map(|e| {
            let offset = e.labels.as_ref().and_then(|l| l.first()).map(|l| l.offset());
            match offset {
                Some(offset) => {
                    let (line, column) = position(source, offset);
                    format!("{} at {}:{}", e, line, column)
                }
                None => e.to_string(),
            }
        })
        .collect();
    let message = if details.is_empty() {
        "unrecoverable parse error".to_string()
    } else {
        details.join("; ")
    };
    debug!(script = name, error = %message, "Script failed syntax check");
    AppError::validation(format!("syntax error in script '{}': {}", name, message))
}

/// 1-based line and column of a byte offset.
fn position(source: &str, offset: usize) -> (usize, usize) {
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let column = before.len() - before.rfind('\n').map_or(0, |i| i + 1) + 1;
    (line, column)
}
