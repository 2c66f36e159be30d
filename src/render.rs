use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};

use crate::params::ParameterSet;

/// Marker splitting a template into prefix, placeholder and suffix.
pub const PARAMS_MARKER: &str = "<!-- -=*=- -->";

const BUILTIN_PREFIX: &str = "<!doctype html>\n<html lang=\"en\">\n  <head>\n";
const BUILTIN_SUFFIX: &str = r#"    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title></title>
  </head>
  <body>
    <div id="app"></div>
  </body>
</html>
"#;

#[derive(Debug, Clone)]
struct TemplateParts {
    prefix: String,
    suffix: String,
}

impl TemplateParts {
    fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(PARAMS_MARKER).collect();
        if parts.len() != 3 {
            bail!(
                "template must contain the marker {PARAMS_MARKER} exactly twice, found {}",
                parts.len().saturating_sub(1)
            );
        }
        Ok(Self {
            prefix: parts[0].to_string(),
            suffix: parts[2].to_string(),
        })
    }
}

/// Page shell receiving one `<meta>` tag per decoded parameter.
#[derive(Debug, Clone)]
pub struct PageTemplate {
    parts: TemplateParts,
    source: Option<PathBuf>,
    reload: bool,
}

impl PageTemplate {
    pub fn builtin() -> Self {
        Self {
            parts: TemplateParts {
                prefix: BUILTIN_PREFIX.into(),
                suffix: BUILTIN_SUFFIX.into(),
            },
            source: None,
            reload: false,
        }
    }

    /// Load a template from disk. With `reload` set the file is re-read on every render.
    pub fn from_file(path: &Path, reload: bool) -> Result<Self> {
        let parts = read_parts(path)?;
        Ok(Self {
            parts,
            source: Some(path.to_path_buf()),
            reload,
        })
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(Self {
            parts: TemplateParts::parse(raw)?,
            source: None,
            reload: false,
        })
    }

    pub fn render(&self, params: &ParameterSet) -> Result<String> {
        let reloaded;
        let parts = match (&self.source, self.reload) {
            (Some(path), true) => {
                reloaded = read_parts(path)?;
                &reloaded
            }
            _ => &self.parts,
        };

        let mut page = String::with_capacity(parts.prefix.len() + parts.suffix.len() + 256);
        page.push_str(&parts.prefix);
        for (name, value) in params.iter() {
            let _ = writeln!(
                page,
                "    <meta name=\"{}\" content=\"{}\">",
                escape_attr(name),
                escape_attr(value)
            );
        }
        page.push_str(&parts.suffix);
        Ok(page)
    }
}

/// Static page served on the bare base domain.
#[derive(Debug, Clone)]
pub struct HomePage {
    body: String,
    source: Option<PathBuf>,
    reload: bool,
}

impl HomePage {
    pub fn from_file(path: &Path, reload: bool) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("Unable to read home page at {}", path.display()))?;
        Ok(Self {
            body,
            source: Some(path.to_path_buf()),
            reload,
        })
    }

    pub fn from_string(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            source: None,
            reload: false,
        }
    }

    pub fn render(&self) -> Result<String> {
        match (&self.source, self.reload) {
            (Some(path), true) => fs::read_to_string(path)
                .with_context(|| format!("Unable to read home page at {}", path.display())),
            _ => Ok(self.body.clone()),
        }
    }
}

fn read_parts(path: &Path) -> Result<TemplateParts> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Unable to read page template at {}", path.display()))?;
    TemplateParts::parse(&raw)
        .with_context(|| format!("Malformed page template at {}", path.display()))
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
