//! Minimal `{{KEY}}` substitution, grounded on `template.py`'s thin
//! Jinja2 wrapper — no control flow, just straight variable interpolation,
//! matching spec.md's direction that this component stay undetailed.

use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {0}: {1}")]
    Read(String, std::io::Error),
}

pub fn render(templates_dir: &Path, template_name: &str, context: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let path = templates_dir.join(template_name);
    let raw = std::fs::read_to_string(&path).map_err(|e| TemplateError::Read(path.display().to_string(), e))?;
    Ok(substitute(&raw, context))
}

fn substitute(raw: &str, context: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = context.get(key) {
                    out.push_str(value);
                } else {
                    out.push_str("{{");
                    out.push_str(key);
                    out.push_str("}}");
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_keys_and_leaves_unknown_ones_verbatim() {
        let mut ctx = BTreeMap::new();
        ctx.insert("FQDN".to_string(), "swarm.example.com".to_string());
        let rendered = substitute("server_name {{ FQDN }}; unknown {{MISSING}};", &ctx);
        assert_eq!(rendered, "server_name swarm.example.com; unknown {{MISSING}};");
    }
}
