//! Static policy check for generated Python.
//!
//! Runs before anything executes and depends only on the source text, so the
//! same code always gets the same verdict. The check is conservative: a
//! forbidden name inside a string is still rejected. It is the first of two
//! layers; the harness also installs a runtime guard (see `harness.rs`).

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::prompt::ALLOWED_MODULES;

const FORBIDDEN_CALLS: &[&str] = &[
    "open",
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "getattr",
    "setattr",
    "delattr",
    "vars",
    "input",
    "breakpoint",
];

/// Dunder names ordinary model code may use. Everything else (`__class__`,
/// `__globals__`, `__builtins__`, `__subclasses__`, ...) is rejected.
const ALLOWED_DUNDERS: &[&str] = &[
    "__init__", "__name__", "__main__", "__repr__", "__str__", "__len__", "__iter__",
    "__eq__", "__lt__",
];

/// pandas / numpy entry points that touch files, URLs or native code.
const IO_NAMES: &str = r"read_\w+|to_(?:csv|excel|json|pickle|parquet|sql|hdf|feather|html|latex|markdown|stata|xml|clipboard|orc|gbq)|tofile|fromfile|loadtxt|genfromtxt|fromregex|savetxt|savez\w*|save|load|memmap|ExcelWriter|ExcelFile|HDFStore|DataSource|ctypeslib|f2py|distutils|testing|io|lib";

/// A statement starts at a line start (`\n` or a bare `\r`), after `;`, or
/// after the `:` of a one-line compound statement. Indentation may contain
/// form feeds.
const STATEMENT_START: &str = r"(?m)(?:^|[;:\r])[ \t\x0c]*";

static IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{}import[ \t\x0c]+([^;\r\n#]+)", STATEMENT_START))
        .expect("valid import regex")
});

static FROM_IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"{}from[ \t\x0c]+(\S+)[ \t\x0c]+import\b([^;\r\n#]*)",
        STATEMENT_START
    ))
    .expect("valid from-import regex")
});

static IMPORT_KEYWORD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bimport\b").expect("valid import keyword regex"));

static CALL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    let names = FORBIDDEN_CALLS.join("|");
    Regex::new(&format!(r"(?:^|[^\w.])({})\s*\(", names)).expect("valid call regex")
});

static IO_ATTRIBUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\.\s*({})\b", IO_NAMES)).expect("valid io attribute regex")
});

static IO_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^(?:{})$", IO_NAMES)).expect("valid io name regex"));

static DUNDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__\w+__").expect("valid dunder regex"));

static ENTRY_POINT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^def\s+forecast\s*\(").expect("valid entry point regex"));

fn top_level_module(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

fn check_module(module: &str) -> Result<(), String> {
    let top = top_level_module(module.trim());
    if top.is_empty() || !ALLOWED_MODULES.contains(&top) {
        return Err(format!("import of '{}' is not allowed", module.trim()));
    }
    Ok(())
}

/// Names bound by `from x import a, b as c`.
fn imported_names(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').filter_map(|item| {
        item.trim_matches(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | '\\'))
            .split_whitespace()
            .next()
    })
}

/// Every `import` keyword must belong to a recognised import statement.
/// Comments are cut at the first `#` on each line.
fn check_stray_imports(code: &str, statements: &[(usize, usize)]) -> Result<(), String> {
    let mut offset = 0;
    for line in code.split_inclusive('\n') {
        let live = line.split('#').next().unwrap_or(line);
        for m in IMPORT_KEYWORD_REGEX.find_iter(live) {
            let at = offset + m.start();
            if !statements.iter().any(|&(start, end)| at >= start && at < end) {
                return Err("import outside of an import statement is not allowed".to_string());
            }
        }
        offset += line.len();
    }
    Ok(())
}

/// Return `Err(detail)` describing the first violation found.
pub fn check_python(code: &str) -> Result<(), String> {
    let mut statements = Vec::new();
    for caps in IMPORT_REGEX.captures_iter(code) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        statements.push(whole);
        for item in caps[1].split(',') {
            let module = item.split_whitespace().next().unwrap_or("");
            check_module(module)?;
        }
    }
    for caps in FROM_IMPORT_REGEX.captures_iter(code) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        statements.push(whole);
        let module = &caps[1];
        if module.starts_with('.') {
            return Err(format!("relative import '{}' is not allowed", module));
        }
        check_module(module)?;
        if let Some(name) = imported_names(&caps[2]).find(|n| *n == "*" || IO_NAME_REGEX.is_match(n)) {
            return Err(format!("import of '{}' from '{}' is not allowed", name, module));
        }
    }
    check_stray_imports(code, &statements)?;

    if let Some(caps) = CALL_REGEX.captures(code) {
        return Err(format!("call to '{}' is not allowed", &caps[1]));
    }
    if let Some(caps) = IO_ATTRIBUTE_REGEX.captures(code) {
        return Err(format!("file or network access via '{}' is not allowed", &caps[1]));
    }
    if let Some(m) = DUNDER_REGEX
        .find_iter(code)
        .find(|m| !ALLOWED_DUNDERS.contains(&m.as_str()))
    {
        return Err(format!("access to '{}' is not allowed", m.as_str()));
    }
    if !ENTRY_POINT_REGEX.is_match(code) {
        return Err("missing entry point 'def forecast(parameters, inputs)'".to_string());
    }
    Ok(())
}

/// Allowed top-level modules the code imports, in a stable order.
pub fn imported_modules(code: &str) -> BTreeSet<&'static str> {
    let mut found = BTreeSet::new();
    let mut note = |path: &str| {
        let top = top_level_module(path.trim());
        if let Some(module) = ALLOWED_MODULES.iter().find(|m| **m == top) {
            found.insert(*module);
        }
    };
    for caps in IMPORT_REGEX.captures_iter(code) {
        for item in caps[1].split(',') {
            note(item.split_whitespace().next().unwrap_or(""));
        }
    }
    for caps in FROM_IMPORT_REGEX.captures_iter(code) {
        note(&caps[1]);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "\
import math
from collections import OrderedDict
import numpy as np, pandas as pd

def forecast(parameters, inputs):
    n = parameters['periods']
    frame = pd.DataFrame(inputs['sales']['rows'])
    return {'series': [math.pow(1.05, i) for i in range(n)], 'rows': frame.to_dict()}
";

    fn with_entry(prefix: &str) -> String {
        format!("{}\ndef forecast(p, i):\n    return {{}}\n", prefix)
    }

    #[test]
    fn test_accepts_allowed_code() {
        assert_eq!(check_python(GOOD), Ok(()));
    }

    #[test]
    fn test_rejects_disallowed_imports() {
        assert!(check_python(&with_entry("import os")).unwrap_err().contains("'os'"));
        assert!(check_python(&with_entry("from subprocess import run")).unwrap_err().contains("subprocess"));
        assert!(check_python(&with_entry("import math, socket")).unwrap_err().contains("socket"));
        assert!(check_python(&with_entry("from . import x")).is_err());
    }

    #[test]
    fn test_rejects_imports_after_statement_separators() {
        for prefix in [
            "x = 0; import os",
            "if 1: import os",
            "try: import socket\nexcept Exception: pass",
            "x = 1\rimport os",
            "\x0cimport os",
            "y = 2;from os import path",
        ] {
            assert!(check_python(&with_entry(prefix)).is_err(), "{:?} should be rejected", prefix);
        }
    }

    #[test]
    fn test_rejects_import_after_line_continuation() {
        let code = "def forecast(p, i):\n    return {}\nw = 1 \\\n import os\n";
        assert!(check_python(code).is_err());
    }

    #[test]
    fn test_stray_import_outside_statement() {
        let statements = [(0, 10)];
        assert_eq!(check_stray_imports("import os\n", &statements), Ok(()));
        assert!(check_stray_imports("x = 1 import os\n", &[]).is_err());
        assert_eq!(check_stray_imports("x = 1  # import os\n", &[]), Ok(()));
    }

    #[test]
    fn test_import_word_in_comment_is_fine() {
        let code = "def forecast(p, i):\n    # nothing to import here\n    return {'series': [1]}\n";
        assert_eq!(check_python(code), Ok(()));
    }

    #[test]
    fn test_rejects_pandas_and_numpy_io() {
        for body in [
            "pd.read_csv('/etc/passwd')",
            "pd.read_csv('http://example.com/x.csv')",
            "frame.to_csv('out.csv')",
            "np.loadtxt('/etc/hosts')",
            "np.save('x.npy', a)",
            "np.fromfile('/dev/zero')",
            "pd.io.common.get_handle('x', 'r')",
            "np.lib.npyio.load('x')",
        ] {
            let code = format!("import numpy as np\nimport pandas as pd\ndef forecast(p, i):\n    {}\n    return {{}}\n", body);
            assert!(check_python(&code).is_err(), "{} should be rejected", body);
        }
        let code = with_entry("from pandas import read_csv");
        assert!(check_python(&code).unwrap_err().contains("read_csv"));
        let code = with_entry("from numpy import *");
        assert!(check_python(&code).is_err());
    }

    #[test]
    fn test_submodule_of_allowed_package_is_fine() {
        let code = "import numpy.random\ndef forecast(p, i):\n    return {}\n";
        assert_eq!(check_python(code), Ok(()));
    }

    #[test]
    fn test_rejects_forbidden_calls() {
        for call in ["open('x')", "eval('1')", "exec ('1')", "getattr(p, 'x')", "__import__('os')"] {
            let code = format!("def forecast(p, i):\n    {}\n    return {{}}\n", call);
            assert!(check_python(&code).is_err(), "{} should be rejected", call);
        }
    }

    #[test]
    fn test_method_named_like_builtin_is_allowed() {
        let code = "def forecast(p, i):\n    return {'series': p.compile_rates()}\n";
        // `compile_rates` is a different identifier; `.compile(` would be a method call.
        assert_eq!(check_python(code), Ok(()));
        let code = "def forecast(p, i):\n    return {'series': i.open(1)}\n";
        assert_eq!(check_python(code), Ok(()));
    }

    #[test]
    fn test_rejects_dunder_escape() {
        let code = "def forecast(p, i):\n    return ().__class__.__bases__\n";
        assert!(check_python(code).unwrap_err().contains("__class__"));
    }

    #[test]
    fn test_requires_entry_point() {
        let code = "def predict(p, i):\n    return {}\n";
        assert!(check_python(code).unwrap_err().contains("entry point"));
    }

    #[test]
    fn test_verdict_is_deterministic() {
        let code = "import os\ndef forecast(p, i):\n    return {}\n";
        assert_eq!(check_python(code), check_python(code));
    }

    #[test]
    fn test_imported_modules() {
        let modules: Vec<_> = imported_modules(GOOD).into_iter().collect();
        assert_eq!(modules, vec!["collections", "math", "numpy", "pandas"]);
    }
}
