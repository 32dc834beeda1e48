//! Dockerfile and runtime-wrapper rendering.

use lambda_core::{Language, LambdaError};
use lambda_sources::guard;
use minijinja::{context, AutoEscape, Environment};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static TEMPLATES: Lazy<Result<Environment<'static>, minijinja::Error>> = Lazy::new(|| {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    for (name, src) in [
        ("dockerfile/python", include_str!("../templates/Dockerfile.python.j2")),
        ("dockerfile/node", include_str!("../templates/Dockerfile.node.j2")),
        ("dockerfile/go", include_str!("../templates/Dockerfile.go.j2")),
        ("wrapper/python", include_str!("../templates/runtime.py.j2")),
        ("wrapper/node", include_str!("../templates/runtime.js.j2")),
    ] {
        env.add_template(name, src)?;
    }
    Ok(env)
});

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{1,3}(\.[0-9]{1,3}){0,2}$").expect("static pattern"));

/// Inputs shared by every template.
#[derive(Debug, Clone)]
pub struct RenderInput<'a> {
    pub function_name: &'a str,
    pub namespace: &'a str,
    pub language: Language,
    pub version: &'a str,
    pub handler: Option<&'a str>,
    pub timeout_secs: i64,
    /// Base image without a tag, e.g. `localhost:5001/python`.
    pub base_image: &'a str,
    /// Final stage for compiled runtimes.
    pub runtime_image: &'a str,
}

/// The runtime version lands in a `FROM` line, so only dotted numbers are accepted.
pub fn validate_version(version: &str) -> Result<(), LambdaError> {
    if version.is_empty() || VERSION_RE.is_match(version) {
        Ok(())
    } else {
        Err(LambdaError::Validation(format!("runtime.version '{version}' must be dotted numbers like 3.11")))
    }
}

/// `registry:5001/python:3.11-slim` -> `registry:5001/python`. Digests are dropped too.
pub fn strip_tag(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].find(':') {
        Some(i) => &image[..last_slash + i],
        None => image,
    }
}

fn handler_parts(handler: &str) -> (&str, &str) {
    handler.split_once('.').unwrap_or(("main", "handler"))
}

fn render(name: &str, ctx: minijinja::Value) -> Result<String, LambdaError> {
    let env = TEMPLATES.as_ref().map_err(|e| LambdaError::Build(format!("loading templates: {e}")))?;
    env.get_template(name)
        .and_then(|t| t.render(ctx))
        .map_err(|e| LambdaError::Build(format!("rendering {name}: {e}")))
}

pub fn dockerfile(input: &RenderInput<'_>) -> Result<String, LambdaError> {
    validate_version(input.version)?;
    let version = if input.version.is_empty() { input.language.default_version() } else { input.version };
    let handler = guard::sanitize_handler(input.handler);
    render(
        &format!("dockerfile/{}", template_key(input.language)),
        context! {
            base_image => strip_tag(input.base_image),
            runtime_image => input.runtime_image,
            version => version,
            source_file => input.language.source_filename(),
            wrapper_file => input.language.wrapper_filename().unwrap_or_default(),
            function_name => input.function_name,
            function_namespace => input.namespace,
            handler => handler,
            timeout_secs => input.timeout_secs,
        },
    )
}

/// Thin HTTP wrapper that imports the entry module and calls the handler's function.
/// The handler is sanitised first; anything that is not `module.function` becomes the default.
pub fn wrapper(input: &RenderInput<'_>) -> Result<Option<(&'static str, String)>, LambdaError> {
    let Some(filename) = input.language.wrapper_filename() else {
        return Ok(None);
    };
    let handler = guard::sanitize_handler(input.handler);
    let (_module, function) = handler_parts(&handler);
    let entry_module = input.language.source_filename().split('.').next().unwrap_or("main");
    let body = render(
        &format!("wrapper/{}", template_key(input.language)),
        context! {
            function_name => input.function_name,
            entry_module => entry_module,
            function => function,
        },
    )?;
    Ok(Some((filename, body)))
}

fn template_key(language: Language) -> &'static str {
    match language {
        Language::Python => "python",
        Language::Node => "node",
        Language::Go => "go",
    }
}

/// Manifest used when the source brought none.
pub fn default_dependencies(language: Language, version: &str) -> String {
    match language {
        Language::Python => "# Auto-generated\n".to_string(),
        Language::Node => "{\n  \"name\": \"lambda-function\",\n  \"version\": \"1.0.0\",\n  \"private\": true\n}\n".to_string(),
        Language::Go => {
            let v = if version.is_empty() { language.default_version() } else { version };
            let directive: Vec<&str> = v.split('.').take(2).collect();
            format!("module lambda-function\n\ngo {}\n", directive.join("."))
        }
    }
}

/// sha256 over the parts in order, hex encoded.
pub fn content_hash<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    hex::encode(h.finalize())
}
