//! Lightweight TypeScript annotation stripping
//!
//! A regex pass that removes the common type-annotation surface so
//! TypeScript snippets can run in the plain-JavaScript isolate. This is
//! not a compiler: generics on call sites, decorators and other complex
//! type syntax are out of contract, and type errors are never caught.
//! Callers authoring TypeScript steps get erasure, nothing more.
//!
//! Annotations are only recognized when the type token is a TS primitive
//! keyword or a capitalized name, which keeps plain object literals
//! (`{ key: value }`) intact.

use regex::Regex;
use std::sync::OnceLock;

const TYPE_TOKEN: &str = r"(?:number|string|boolean|any|void|unknown|never|object|bigint|[A-Z][\w$]*)(?:<[^<>]*>)?(?:\[\])?(?:\s*\|\s*(?:null|undefined))?";

struct StripPatterns {
    interface_block: Regex,
    type_alias: Regex,
    as_cast: Regex,
    fn_type_params: Regex,
    annotation: Regex,
    return_annotation: Regex,
}

fn patterns() -> &'static StripPatterns {
    static PATTERNS: OnceLock<StripPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| StripPatterns {
        // interface Foo { ... }  (non-nested bodies only)
        interface_block: Regex::new(r"(?m)^\s*(?:export\s+)?interface\s+\w+[^{]*\{[^{}]*\}\s*")
            .unwrap(),
        // type Foo = ...;
        type_alias: Regex::new(r"(?m)^\s*(?:export\s+)?type\s+\w+\s*=[^;]+;\s*").unwrap(),
        // expr as Type
        as_cast: Regex::new(&format!(r"\s+as\s+{}", TYPE_TOKEN)).unwrap(),
        // function foo<T, U>(
        fn_type_params: Regex::new(r"(function\s+\w+)\s*<[\w\s,]+>\s*\(").unwrap(),
        // name: Type / ): Type before , ) = ; { or end of line
        annotation: Regex::new(&format!(
            r"([\w$\)\]])\s*:\s*{}(?P<ws>\s*)(?P<term>[,\)=;\n]|$)",
            TYPE_TOKEN
        ))
        .unwrap(),
        // ): Type => / ): Type {
        return_annotation: Regex::new(&format!(
            r"\)\s*:\s*{}(?P<ws>\s*)(?P<term>=>|\{{)",
            TYPE_TOKEN
        ))
        .unwrap(),
    })
}

/// Strip the common TypeScript annotation forms, returning plain JavaScript.
pub fn strip_types(source: &str) -> String {
    let p = patterns();
    let code = p.interface_block.replace_all(source, "");
    let code = p.type_alias.replace_all(&code, "");
    let code = p.return_annotation.replace_all(&code, ")$ws$term");
    let code = p.annotation.replace_all(&code, "$1$ws$term");
    let code = p.as_cast.replace_all(&code, "");
    let code = p.fn_type_params.replace_all(&code, "$1(");
    code.into_owned()
}
