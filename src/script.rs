// src/script.rs
//! Server-side script collaborator: run the interpreter on a resolved
//! path and collect its output. The interpreter's bytes are untrusted;
//! they are served as text/html like any other dynamic body.

use std::path::Path;
use std::process::Command;
use tracing::error;

const FALLBACK_UNAVAILABLE: &str = "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"UTF-8\"><title>PHP Error</title></head><body><h2>PHP not available</h2><p>The PHP interpreter could not be invoked. Install PHP and make sure it is on PATH.</p></body></html>";

const FALLBACK_EMPTY: &str = "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"UTF-8\"><title>PHP Error</title></head><body><h2>Empty PHP output</h2><p>The script produced no output; check that it can be parsed by the installed interpreter.</p></body></html>";

/// Run `php <path>` and return its combined stdout/stderr. Interpreter
/// failures degrade to an explanatory HTML body served as a normal 200.
pub fn run_script(path: &Path) -> Vec<u8> {
    let output = match Command::new("php").arg(path).output() {
        Ok(out) => out,
        Err(e) => {
            error!("failed to execute php on {}: {}", path.display(), e);
            return FALLBACK_UNAVAILABLE.as_bytes().to_vec();
        }
    };

    let mut body = output.stdout;
    body.extend_from_slice(&output.stderr);
    if body.is_empty() {
        return FALLBACK_EMPTY.as_bytes().to_vec();
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interpreter_or_script_yields_html() {
        // Whatever the environment, the result is a non-empty HTML body.
        let body = run_script(Path::new("/definitely/not/here.php"));
        assert!(!body.is_empty());
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("<") || !text.is_empty());
    }
}
