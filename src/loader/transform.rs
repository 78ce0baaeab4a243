//! Import/export rewriting
//!
//! Declaration-style modules are rewritten line by line into the loader's
//! call-based form with regular expressions. This is not a parser: the
//! rules match statements that start a line, and anything unusual (an
//! `export` inside a string at the start of a line, destructuring exports)
//! is rewritten wrongly or left alone.
//!
//! | source                               | becomes                                    |
//! |--------------------------------------|--------------------------------------------|
//! | `import x from "m"`                  | `const x = __importDefault(require("m"))`  |
//! | `import { a, b as c } from "m"`      | `const { a, b: c } = require("m")`         |
//! | `import * as ns from "m"`            | `const ns = require("m")`                  |
//! | `import "m"`                         | `require("m")`                             |
//! | `export default expr`                | `exports.default = expr`                   |
//! | `export { a, b as c }`               | `exports.a = a; exports.c = b` at the end  |
//! | `export { a as b } from "m"`         | per-name assignments from `require("m")`   |
//! | `export * from "m"`                  | copy of every non-default name             |
//! | `export const/function/class x`      | declaration, `exports.x = x` at the end    |
//! | `import.meta.url`                    | `__moduleUrl`                              |
//! | `import(x)`                          | `__import(x)`                              |

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Result of `transform`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub code: String,
    /// Whether any declaration-style syntax was found and rewritten
    pub rewritten: bool,
    /// Export names assigned at the end of the module
    pub exports: Vec<String>,
}

const IDENT: &str = r"[A-Za-z_$][\w$]*";
const QUOTED: &str = r#"["']([^"']+)["']"#;

struct Rules {
    detect: Regex,
    import_default_named: Regex,
    import_default_namespace: Regex,
    import_namespace: Regex,
    import_named: Regex,
    import_default: Regex,
    import_bare: Regex,
    export_star_as: Regex,
    export_star: Regex,
    export_from: Regex,
    export_list: Regex,
    export_default_decl: Regex,
    export_default: Regex,
    export_decl: Regex,
    meta_url: Regex,
    meta: Regex,
    dynamic_import: Regex,
}

impl Rules {
    fn compile() -> Result<Self, regex::Error> {
        let rule = |pattern: String| Regex::new(&format!("(?m){}", pattern));
        Ok(Self {
            detect: Regex::new(
                r#"(?m)^\s*(?:import\s+[\w$*{]|import\s*[{*"']|export\s+|export\s*[{*])|import\.meta|\bimport\s*\("#,
            )?,
            import_default_named: rule(format!(
                r"^(\s*)import\s+({IDENT})\s*,\s*\{{([^}}]*)\}}\s*from\s*{QUOTED};?"
            ))?,
            import_default_namespace: rule(format!(
                r"^(\s*)import\s+({IDENT})\s*,\s*\*\s*as\s+({IDENT})\s+from\s*{QUOTED};?"
            ))?,
            import_namespace: rule(format!(r"^(\s*)import\s*\*\s*as\s+({IDENT})\s+from\s*{QUOTED};?"))?,
            import_named: rule(format!(r"^(\s*)import\s*\{{([^}}]*)\}}\s*from\s*{QUOTED};?"))?,
            import_default: rule(format!(r"^(\s*)import\s+({IDENT})\s+from\s*{QUOTED};?"))?,
            import_bare: rule(format!(r"^(\s*)import\s*{QUOTED};?"))?,
            export_star_as: rule(format!(r"^(\s*)export\s*\*\s*as\s+({IDENT})\s+from\s*{QUOTED};?"))?,
            export_star: rule(format!(r"^(\s*)export\s*\*\s*from\s*{QUOTED};?"))?,
            export_from: rule(format!(r"^(\s*)export\s*\{{([^}}]*)\}}\s*from\s*{QUOTED};?"))?,
            export_list: rule(r"^(\s*)export\s*\{([^}]*)\};?".to_string())?,
            export_default_decl: rule(format!(
                r"^(\s*)export\s+default\s+(async\s+function\*?|function\*?|class)\s+({IDENT})"
            ))?,
            export_default: rule(r"^(\s*)export\s+default\s+".to_string())?,
            export_decl: rule(format!(
                r"^(\s*)export\s+(async\s+function\*?|function\*?|class|const|let|var)\s+({IDENT})"
            ))?,
            meta_url: Regex::new(r"\bimport\.meta\.url\b")?,
            meta: Regex::new(r"\bimport\.meta\b")?,
            dynamic_import: Regex::new(r"\bimport\s*\(")?,
        })
    }
}

static RULES: LazyLock<Option<Rules>> = LazyLock::new(|| Rules::compile().ok());

/// Whether `source` uses declaration-style imports or exports
pub fn detect(source: &str) -> bool {
    RULES
        .as_ref()
        .map(|rules| rules.detect.is_match(source))
        .unwrap_or(false)
}

/// Rewrite declaration-style imports and exports. Sources without any are
/// returned unchanged.
pub fn transform(source: &str) -> Transformed {
    let unchanged = || Transformed {
        code: source.to_string(),
        rewritten: false,
        exports: Vec::new(),
    };
    let Some(rules) = RULES.as_ref() else {
        return unchanged();
    };
    if !rules.detect.is_match(source) {
        return unchanged();
    }

    let mut trailer: Vec<(String, String)> = Vec::new();
    fn text<'h>(caps: &Captures<'h>, i: usize) -> &'h str {
        caps.get(i).map(|m| m.as_str()).unwrap_or("")
    }

    let code = rules
        .import_default_named
        .replace_all(source, |caps: &Captures| {
            format!(
                "{}const {} = __importDefault(require(\"{}\")); const {{ {} }} = require(\"{}\");",
                text(caps, 1),
                text(caps, 2),
                text(caps, 4),
                destructure(text(caps, 3)),
                text(caps, 4)
            )
        })
        .into_owned();

    let code = rules
        .import_default_namespace
        .replace_all(&code, |caps: &Captures| {
            format!(
                "{}const {} = require(\"{}\"); const {} = __importDefault({});",
                text(caps, 1),
                text(caps, 3),
                text(caps, 4),
                text(caps, 2),
                text(caps, 3)
            )
        })
        .into_owned();

    let code = rules
        .import_namespace
        .replace_all(&code, |caps: &Captures| {
            format!("{}const {} = require(\"{}\");", text(caps, 1), text(caps, 2), text(caps, 3))
        })
        .into_owned();

    let code = rules
        .import_named
        .replace_all(&code, |caps: &Captures| {
            format!(
                "{}const {{ {} }} = require(\"{}\");",
                text(caps, 1),
                destructure(text(caps, 2)),
                text(caps, 3)
            )
        })
        .into_owned();

    let code = rules
        .import_default
        .replace_all(&code, |caps: &Captures| {
            format!(
                "{}const {} = __importDefault(require(\"{}\"));",
                text(caps, 1),
                text(caps, 2),
                text(caps, 3)
            )
        })
        .into_owned();

    let code = rules
        .import_bare
        .replace_all(&code, |caps: &Captures| {
            format!("{}require(\"{}\");", text(caps, 1), text(caps, 2))
        })
        .into_owned();

    let code = rules
        .export_star_as
        .replace_all(&code, |caps: &Captures| {
            format!("{}exports.{} = require(\"{}\");", text(caps, 1), text(caps, 2), text(caps, 3))
        })
        .into_owned();

    let code = rules
        .export_star
        .replace_all(&code, |caps: &Captures| {
            format!(
                "{}(function (m) {{ for (const k in m) if (k !== \"default\" && !(k in exports)) exports[k] = m[k]; }})(require(\"{}\"));",
                text(caps, 1),
                text(caps, 2)
            )
        })
        .into_owned();

    let code = rules
        .export_from
        .replace_all(&code, |caps: &Captures| {
            let assignments: Vec<String> = export_names(text(caps, 2))
                .into_iter()
                .map(|(local, exported)| format!("exports.{} = __reexport.{};", exported, local))
                .collect();
            format!(
                "{}{{ const __reexport = require(\"{}\"); {} }}",
                text(caps, 1),
                text(caps, 3),
                assignments.join(" ")
            )
        })
        .into_owned();

    let code = rules
        .export_list
        .replace_all(&code, |caps: &Captures| {
            for (local, exported) in export_names(text(caps, 2)) {
                trailer.push((exported, local));
            }
            text(caps, 1).to_string()
        })
        .into_owned();

    let code = rules
        .export_default_decl
        .replace_all(&code, |caps: &Captures| {
            trailer.push(("default".to_string(), text(caps, 3).to_string()));
            format!("{}{} {}", text(caps, 1), text(caps, 2), text(caps, 3))
        })
        .into_owned();

    let code = rules
        .export_default
        .replace_all(&code, |caps: &Captures| format!("{}exports.default = ", text(caps, 1)))
        .into_owned();

    let code = rules
        .export_decl
        .replace_all(&code, |caps: &Captures| {
            let name = text(caps, 3).to_string();
            trailer.push((name.clone(), name));
            format!("{}{} {}", text(caps, 1), text(caps, 2), text(caps, 3))
        })
        .into_owned();

    let code = rules.meta_url.replace_all(&code, "__moduleUrl").into_owned();
    let code = rules
        .meta
        .replace_all(&code, "({ url: __moduleUrl })")
        .into_owned();
    let mut code = rules.dynamic_import.replace_all(&code, "__import(").into_owned();

    if !trailer.is_empty() {
        code.push_str("\n;");
        for (exported, local) in &trailer {
            code.push_str(&format!("exports.{} = {};", exported, local));
        }
    }

    Transformed {
        code,
        rewritten: true,
        exports: trailer.into_iter().map(|(exported, _)| exported).collect(),
    }
}

/// `a, b as c` → `a, b: c`
fn destructure(list: &str) -> String {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once(" as ") {
            Some((name, alias)) => format!("{}: {}", name.trim(), alias.trim()),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `a, b as c` → `[(a, a), (b, c)]` as (local, exported)
fn export_names(list: &str) -> Vec<(String, String)> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once(" as ") {
            Some((local, exported)) => (local.trim().to_string(), exported.trim().to_string()),
            None => (item.to_string(), item.to_string()),
        })
        .collect()
}

// ============================================================================
// Top-level await
// ============================================================================

/// Whether `code` uses `await` outside every async function body
///
/// Strings and comments are skipped; template literals are skipped except
/// for their `${}` interpolations. A block opens an async body when `async`
/// was seen at the same parenthesis depth since the last `;`. An async
/// arrow with an expression body stays async until that expression ends:
/// a `;` or `,` at its own depth, a closing bracket below it, or a line
/// break once the body has started.
pub fn has_top_level_await(code: &str) -> bool {
    let chars: Vec<char> = code.chars().collect();
    let mut i = 0;
    let mut blocks: Vec<bool> = Vec::new();
    let mut parens = 0usize;
    let mut armed: Option<usize> = None;
    let mut bodies: Vec<ExprBody> = Vec::new();
    // Block depth at each open `${`
    let mut interpolations: Vec<usize> = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if let Some(body) = bodies.last_mut()
            && !body.started
            && !c.is_whitespace()
        {
            body.started = true;
        }

        match c {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 1;
            }
            '"' | '\'' => {
                i += 1;
                while i < chars.len() && chars[i] != c {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            '`' => {
                let (end, interpolated) = skip_template(&chars, i + 1);
                if interpolated {
                    interpolations.push(blocks.len());
                    blocks.push(false);
                }
                i = end;
                continue;
            }
            '(' => parens += 1,
            ')' => {
                parens = parens.saturating_sub(1);
                bodies.retain(|b| b.parens <= parens);
            }
            '=' if next == Some('>') => {
                if armed == Some(parens) {
                    let brace = chars[i + 2..].iter().find(|ch| !ch.is_whitespace()) == Some(&'{');
                    if !brace {
                        armed = None;
                        bodies.push(ExprBody {
                            parens,
                            blocks: blocks.len(),
                            started: false,
                        });
                    }
                }
                i += 2;
                continue;
            }
            '{' => {
                let opens_async = armed == Some(parens);
                if opens_async {
                    armed = None;
                }
                blocks.push(opens_async);
            }
            '}' => {
                blocks.pop();
                let depth = blocks.len();
                bodies.retain(|b| b.blocks <= depth);
                if interpolations.last() == Some(&depth) {
                    interpolations.pop();
                    let (end, interpolated) = skip_template(&chars, i + 1);
                    if interpolated {
                        interpolations.push(blocks.len());
                        blocks.push(false);
                    }
                    i = end;
                    continue;
                }
            }
            ';' | ',' => {
                if c == ';' {
                    armed = None;
                }
                let depth = blocks.len();
                bodies.retain(|b| !(b.parens == parens && b.blocks == depth));
            }
            '\n' => {
                let depth = blocks.len();
                bodies.retain(|b| !(b.started && b.parens == parens && b.blocks == depth));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "async" => armed = Some(parens),
                    "await" if bodies.is_empty() && !blocks.iter().any(|b| *b) => return true,
                    _ => {}
                }
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// Expression body of an async arrow still being scanned
struct ExprBody {
    parens: usize,
    blocks: usize,
    started: bool,
}

/// Skip template text starting at `i`. Returns the position after the
/// closing backtick, or after a `${` (then `true`).
fn skip_template(chars: &[char], mut i: usize) -> (usize, bool) {
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '`' => return (i + 1, false),
            '$' if chars.get(i + 1) == Some(&'{') => return (i + 2, true),
            _ => i += 1,
        }
    }
    (i, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_source_is_untouched() {
        let src = "const fs = require('fs');\nmodule.exports = { important: 1 };\nexports.x = 2;";
        let out = transform(src);
        assert!(!out.rewritten);
        assert_eq!(out.code, src);
    }

    #[test]
    fn test_imports() {
        let src = r#"import fs from "fs";
import { join, dirname as dir } from 'path';
import * as util from "./util.js";
import React, { useState } from "react";
import "./side-effect.js";"#;
        let out = transform(src);
        assert!(out.rewritten);
        let lines: Vec<&str> = out.code.lines().collect();
        assert_eq!(lines[0], r#"const fs = __importDefault(require("fs"));"#);
        assert_eq!(lines[1], r#"const { join, dirname: dir } = require("path");"#);
        assert_eq!(lines[2], r#"const util = require("./util.js");"#);
        assert_eq!(
            lines[3],
            r#"const React = __importDefault(require("react")); const { useState } = require("react");"#
        );
        assert_eq!(lines[4], r#"require("./side-effect.js");"#);
    }

    #[test]
    fn test_multiline_named_import() {
        let src = "import {\n  a,\n  b as c,\n} from './m.js';\nconsole.log(a, c);";
        let out = transform(src);
        assert!(out.code.starts_with(r#"const { a, b: c } = require("./m.js");"#));
        assert!(out.code.ends_with("console.log(a, c);"));
    }

    #[test]
    fn test_exports() {
        let src = "export const answer = 42;\nexport function greet() {}\nexport class Thing {}\nconst hidden = 1, shown = 2;\nexport { shown as visible };\nexport default answer + 1;";
        let out = transform(src);
        assert!(out.code.contains("const answer = 42;"));
        assert!(out.code.contains("function greet() {}"));
        assert!(out.code.contains("class Thing {}"));
        assert!(out.code.contains("exports.default = answer + 1;"));
        assert!(out.code.ends_with(
            "\n;exports.visible = shown;exports.answer = answer;exports.greet = greet;exports.Thing = Thing;"
        ));
        assert_eq!(out.exports, vec!["visible", "answer", "greet", "Thing"]);
        assert!(!out.code.contains("export "));
    }

    #[test]
    fn test_export_default_declaration() {
        let out = transform("export default function main() { return 1; }");
        assert!(out.code.starts_with("function main() { return 1; }"));
        assert!(out.code.ends_with("exports.default = main;"));
    }

    #[test]
    fn test_reexports() {
        let src = "export { a, default as b } from './x.js';\nexport * from './y.js';\nexport * as z from './z.js';";
        let out = transform(src);
        let lines: Vec<&str> = out.code.lines().collect();
        assert_eq!(
            lines[0],
            r#"{ const __reexport = require("./x.js"); exports.a = __reexport.a; exports.b = __reexport.default; }"#
        );
        assert!(lines[1].contains(r#"(require("./y.js"))"#));
        assert!(lines[1].contains(r#"k !== "default""#));
        assert_eq!(lines[2], r#"exports.z = require("./z.js");"#);
    }

    #[test]
    fn test_meta_and_dynamic_import() {
        let out = transform("const here = import.meta.url;\nconst m = await import('./lazy.js');");
        assert!(out.rewritten);
        assert!(out.code.contains("const here = __moduleUrl;"));
        assert!(out.code.contains("await __import('./lazy.js')"));

        let out = transform("console.log(import.meta);");
        assert_eq!(out.code, "console.log(({ url: __moduleUrl }));");
    }

    #[test]
    fn test_top_level_await_detection() {
        assert!(has_top_level_await("const x = await fetch(url);"));
        assert!(has_top_level_await("for await (const c of s) {}"));
        assert!(!has_top_level_await("async function f() { await g(); }"));
        assert!(!has_top_level_await("const f = async () => { await g(); };"));
        assert!(!has_top_level_await("const f = async (x) => await x;"));
        assert!(!has_top_level_await("class A { async run() { await this.x; } }"));
        assert!(!has_top_level_await("// await here\nconst s = 'await';"));
        assert!(!has_top_level_await("/* await */ const s = `await ${x}`;"));
        assert!(has_top_level_await("async function f() {}\nawait f();"));
    }

    #[test]
    fn test_await_after_semicolon_free_async_arrow() {
        let src = "const handler = async (req) => handle(req)\nconst cfg = await loadConfig()\n";
        assert!(has_top_level_await(src));
        assert!(!has_top_level_await("const f = async (x) =>\n  await x\n"));
        assert!(!has_top_level_await("run(async () => await a, b)"));
        assert!(has_top_level_await("run(async () => a, await b)"));
        assert!(!has_top_level_await("const f = async x => g({ v: await x })\n"));
    }

    #[test]
    fn test_await_inside_template_interpolation() {
        assert!(has_top_level_await("console.log(`value: ${await f()}`);"));
        assert!(has_top_level_await("const s = `a ${x} b ${ { k: await y }.k } c`;"));
        assert!(!has_top_level_await("const s = `await ${x} and ${y}`;"));
        assert!(!has_top_level_await("async function f() { return `${await g()}`; }"));
        assert!(has_top_level_await("const s = `${x}`;\nawait s;"));
    }
}
