//! Names of child objects derived from their parent.

/// Longest name allowed for Services and label values.
pub const MAX_NAME_LEN: usize = 63;

/// Longest `generateName` prefix; the apiserver appends five random characters.
const MAX_GENERATE_NAME_LEN: usize = MAX_NAME_LEN - 5;

/// `<parent>-<suffix>`, truncating the parent so the result stays a valid DNS label.
pub fn child_name(parent: &str, suffix: &str) -> String {
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len() + 1);
    format!("{}-{suffix}", truncate(parent, budget))
}

/// `<parent>-` suitable for `metadata.generateName`.
pub fn generate_name(parent: &str) -> String {
    format!("{}-", truncate(parent, MAX_GENERATE_NAME_LEN - 1))
}

/// A label value naming `name`, shortened to fit when needed.
///
/// Names that are too long keep a prefix plus an eight digit hash of the full
/// name, so distinct parents still select distinct children.
pub fn label_value(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    format!("{}-{:08x}", truncate(name, MAX_NAME_LEN - 9), fnv1a(name))
}

/// 32 bit FNV-1a; stable across builds, unlike `DefaultHasher`.
fn fnv1a(s: &str) -> u32 {
    s.bytes()
        .fold(0x811c_9dc5, |h: u32, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193))
}

fn truncate(name: &str, max: usize) -> &str {
    let cut = name.char_indices().nth(max).map_or(name.len(), |(i, _)| i);
    name[..cut].trim_end_matches(['-', '.'])
}
