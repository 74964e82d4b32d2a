//! `bauleiter list-projects`

use crate::error::BuildResult;
use crate::settings::Settings;
use crate::steps::expand_arg;
use convenient_project::{Project, ProjectRegistry, find_projects};
use std::collections::BTreeMap;
use std::io::Write;

/// Print every selected project through `format`.
pub fn execute(settings: &Settings, selectors: &[String], format: &str) -> BuildResult<()> {
    let registry = find_projects(&settings.search_dirs)?;
    let listing = render_all(&registry, selectors, format)?;

    let mut stdout = std::io::stdout().lock();
    let written = stdout.write_all(listing.as_bytes());
    written
        .and_then(|()| stdout.flush())
        .map_err(crate::error::BuildError::io("<stdout>"))
}

/// Render the selection; no selectors means every project.
pub fn render_all(
    registry: &ProjectRegistry,
    selectors: &[String],
    format: &str,
) -> BuildResult<String> {
    let template = unescape(format);
    let ids = registry.resolve(selectors, selectors.is_empty())?;
    Ok(ids
        .into_iter()
        .map(|id| render(&template, registry.get(id)))
        .collect())
}

/// Fill one project into a template.
pub fn render(template: &str, project: &Project) -> String {
    let vars = BTreeMap::from([
        ("name", project.name.clone()),
        ("board", project.board.clone()),
        ("program", project.program.clone()),
        ("toolchains", project.toolchains.join(",")),
        ("packer", project.packer.to_string()),
        ("signer", project.signer.to_string()),
        ("dir", project.dir.display().to_string()),
    ]);
    expand_arg(template, &vars)
}

/// Honour `\n`, `\t` and `\\`.
pub fn unescape(format: &str) -> String {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
