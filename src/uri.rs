//! URL helpers: `{placeholder}` template substitution and relative-URL
//! resolution against a base.

/// Substitute `{name}` placeholders using the given lookup. Placeholders the
/// lookup declines (by returning `None`) pass through unchanged, braces and
/// all.
pub fn substitute_template_parameters<F>(template: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let name = &after_open[..close];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                // Unmatched brace; keep the remainder verbatim.
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Resolve `relative` against `base`.
///
/// Absolute URLs (scheme or leading `/`) replace the base's path entirely;
/// otherwise the relative path replaces everything after the base's last
/// `/`. Handles both URL-style bases (`https://host/a/b.json`) and plain
/// paths.
pub fn resolve(base: &str, relative: &str) -> String {
    if relative.contains("://") {
        return relative.to_owned();
    }

    if let Some(scheme_end) = base.find("://") {
        let authority_start = scheme_end + 3;
        let path_start = base[authority_start..]
            .find('/')
            .map(|i| authority_start + i)
            .unwrap_or(base.len());

        if relative.starts_with('/') {
            return format!("{}{}", &base[..path_start], relative);
        }
        if path_start == base.len() {
            return format!("{base}/{relative}");
        }

        let dir_end = base.rfind('/').map(|i| i + 1).unwrap_or(base.len());
        let dir_end = dir_end.max(path_start + 1).min(base.len());
        return format!("{}{}", &base[..dir_end], relative);
    }

    // Plain path base
    if relative.starts_with('/') {
        return relative.to_owned();
    }
    match base.rfind('/') {
        Some(i) => format!("{}{}", &base[..=i], relative),
        None => relative.to_owned(),
    }
}

/// The base content type, stripped of parameters and lowercased:
/// `"Application/JSON; charset=utf-8"` → `"application/json"`.
pub fn base_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// The lowercased file extension of a URL, query string stripped:
/// `"a/b/Tile.B3DM?v=2"` → `Some(".b3dm")`.
pub fn file_extension(url: &str) -> Option<String> {
    let without_query = url.split('?').next().unwrap_or(url);
    let last_segment = without_query.rsplit('/').next().unwrap_or(without_query);
    last_segment
        .rfind('.')
        .map(|i| last_segment[i..].to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadtree_lookup(level: u32, x: u32, y: u32) -> impl FnMut(&str) -> Option<String> {
        move |name| match name {
            "level" | "z" => Some(level.to_string()),
            "x" => Some(x.to_string()),
            "y" => Some(y.to_string()),
            "version" => Some("1.2.0".to_owned()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_placeholders() {
        let url = substitute_template_parameters(
            "tiles/{level}/{x}/{y}.terrain?v={version}",
            quadtree_lookup(3, 5, 7),
        );
        assert_eq!(url, "tiles/3/5/7.terrain?v=1.2.0");
    }

    #[test]
    fn z_aliases_level_for_quadtrees() {
        let url = substitute_template_parameters("{z}/{x}/{y}.png", quadtree_lookup(4, 1, 2));
        assert_eq!(url, "4/1/2.png");
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let url = substitute_template_parameters("{level}/{unknown}/{x}", quadtree_lookup(1, 2, 3));
        assert_eq!(url, "1/{unknown}/2");
    }

    #[test]
    fn unmatched_brace_is_kept() {
        let url = substitute_template_parameters("tiles/{level", quadtree_lookup(1, 2, 3));
        assert_eq!(url, "tiles/{level");
    }

    #[test]
    fn substitute_then_parse_round_trips() {
        // Round-trip law: substituting components and reading them back off
        // the canonical URL yields the same components.
        for (level, x, y) in [(0u32, 0u32, 0u32), (5, 17, 9), (12, 4095, 1)] {
            let url = substitute_template_parameters(
                "{level}/{x}/{y}.terrain",
                quadtree_lookup(level, x, y),
            );
            let parts: Vec<&str> = url.trim_end_matches(".terrain").split('/').collect();
            assert_eq!(parts[0].parse::<u32>().unwrap(), level);
            assert_eq!(parts[1].parse::<u32>().unwrap(), x);
            assert_eq!(parts[2].parse::<u32>().unwrap(), y);
        }
    }

    #[test]
    fn resolve_relative_against_url() {
        assert_eq!(
            resolve("https://example.com/scene/tileset.json", "tiles/0.b3dm"),
            "https://example.com/scene/tiles/0.b3dm"
        );
    }

    #[test]
    fn resolve_absolute_path_against_url() {
        assert_eq!(
            resolve("https://example.com/scene/tileset.json", "/other/x.json"),
            "https://example.com/other/x.json"
        );
    }

    #[test]
    fn resolve_absolute_url_wins() {
        assert_eq!(
            resolve("https://example.com/a.json", "https://cdn.net/b.json"),
            "https://cdn.net/b.json"
        );
    }

    #[test]
    fn resolve_against_plain_path() {
        assert_eq!(resolve("scene/tileset.json", "tiles/0.glb"), "scene/tiles/0.glb");
        assert_eq!(resolve("tileset.json", "tiles/0.glb"), "tiles/0.glb");
    }

    #[test]
    fn resolve_host_only_base() {
        assert_eq!(
            resolve("https://example.com", "layer.json"),
            "https://example.com/layer.json"
        );
    }

    #[test]
    fn content_type_base() {
        assert_eq!(
            base_content_type("Application/JSON; charset=utf-8"),
            "application/json"
        );
        assert_eq!(base_content_type("image/png"), "image/png");
        assert_eq!(base_content_type(""), "");
    }

    #[test]
    fn extension_lowercased_and_query_stripped() {
        assert_eq!(file_extension("a/b/Tile.B3DM?v=2"), Some(".b3dm".to_owned()));
        assert_eq!(file_extension("tileset.json"), Some(".json".to_owned()));
        assert_eq!(file_extension("no-extension"), None);
        assert_eq!(file_extension("dir.d/file"), None);
    }
}
