//! Domain ID generation: `{hex-prefix}-{type}-{slug}`, e.g. `a1b2c3-task-fix-login-bug`.

use uuid::Uuid;

/// Generate a new id for a domain entity of the given type.
pub fn generate_id(domain_type: &str, title: &str) -> String {
    let hex = Uuid::now_v7().simple().to_string();
    let prefix = &hex[..6];
    format!("{}-{}-{}", prefix, domain_type, slugify(title))
}

/// Lowercase, hyphen-separated slug. Apostrophes are dropped rather than turned
/// into hyphens so "don't" becomes "dont", not "don-t".
pub fn slugify(input: &str) -> String {
    let stripped: String = input
        .chars()
        .filter(|c| *c != '\'' && *c != '\u{2018}' && *c != '\u{2019}')
        .collect();

    let mut slug = String::new();
    let mut last_was_hyphen = true; // suppress leading hyphen
    for c in stripped.chars() {
        if c.is_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.chars().take(50).collect()
}
