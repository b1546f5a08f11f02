//! Reader for the cell description file. Follows the usual INI dialect: `[section]` headers,
//! `key = value` or `key: value` options with case-insensitive keys, full-line `#` or `;`
//! comments, indented continuation lines and a `DEFAULT` section consulted as fallback.
//! Values are kept as raw text; `%` interpolation is not performed.
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ParamError;

pub const DEFAULT_SECTION: &str = "DEFAULT";

#[derive(Debug, Clone, Default)]
struct Section {
    name: String,
    options: Vec<(String, String)>,
}

impl Section {
    fn find(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ini {
    defaults: Section,
    sections: Vec<Section>,
}

impl Ini {
    pub fn load(path: &Path) -> Result<Self, ParamError> {
        let text = std::fs::read_to_string(path)?;
        let ini = Self::parse(&text, path)?;
        debug!(
            "read {} sections from {}",
            ini.sections.len(),
            path.display()
        );
        Ok(ini)
    }

    /// `origin` only labels errors.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ParamError> {
        let err = |line: usize, msg: String| ParamError::Ini {
            path: PathBuf::from(origin),
            line,
            msg,
        };
        let mut ini = Ini {
            defaults: Section {
                name: DEFAULT_SECTION.to_string(),
                options: Vec::new(),
            },
            sections: Vec::new(),
        };
        // None until the first header; Some(None) for DEFAULT
        let mut current: Option<Option<usize>> = None;
        let mut last_key: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let stripped = raw.trim();
            if stripped.is_empty() || stripped.starts_with('#') || stripped.starts_with(';') {
                continue;
            }
            let indented = raw.starts_with(char::is_whitespace);
            if let (true, Some(section), Some(key)) = (indented, current, last_key.as_ref()) {
                let section = match section {
                    Some(i) => &mut ini.sections[i],
                    None => &mut ini.defaults,
                };
                if let Some((_, value)) = section.options.iter_mut().find(|(k, _)| k == key) {
                    if !value.is_empty() {
                        value.push('\n');
                    }
                    value.push_str(stripped);
                    continue;
                }
            }
            if let Some(rest) = stripped.strip_prefix('[') {
                let Some(end) = rest.rfind(']') else {
                    return Err(err(lineno, format!("unterminated section header {:?}", raw)));
                };
                let name = &rest[..end];
                if name.is_empty() {
                    return Err(err(lineno, "empty section name".to_string()));
                }
                last_key = None;
                if name == DEFAULT_SECTION {
                    current = Some(None);
                    continue;
                }
                if ini.sections.iter().any(|s| s.name == name) {
                    return Err(err(lineno, format!("section {:?} already exists", name)));
                }
                ini.sections.push(Section {
                    name: name.to_string(),
                    options: Vec::new(),
                });
                current = Some(Some(ini.sections.len() - 1));
                continue;
            }
            let Some(section) = current else {
                return Err(err(lineno, "option before any section header".to_string()));
            };
            let Some(split) = stripped.find(['=', ':']) else {
                return Err(err(lineno, format!("expected `key = value`, got {:?}", raw)));
            };
            let key = stripped[..split].trim().to_lowercase();
            let value = stripped[split + 1..].trim().to_string();
            if key.is_empty() {
                return Err(err(lineno, "empty option name".to_string()));
            }
            let section = match section {
                Some(i) => &mut ini.sections[i],
                None => &mut ini.defaults,
            };
            if section.find(&key).is_some() {
                return Err(err(
                    lineno,
                    format!("option {:?} in section {:?} already exists", key, section.name),
                ));
            }
            section.options.push((key.clone(), value));
            last_key = Some(key);
        }
        Ok(ini)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.iter().any(|s| s.name == section)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    /// Looks `key` up case-insensitively, falling back to the `DEFAULT` section.
    pub fn get(&self, section: &str, key: &str) -> Result<&str, ParamError> {
        let key = key.to_lowercase();
        let Some(found) = self.sections.iter().find(|s| s.name == section) else {
            return Err(ParamError::MissingSection(section.to_string()));
        };
        found
            .find(&key)
            .or_else(|| self.defaults.find(&key))
            .ok_or_else(|| ParamError::MissingOption {
                section: section.to_string(),
                key,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(text: &str) -> Result<Ini, ParamError> {
        Ini::parse(text, Path::new("cell.ini"))
    }

    #[test]
    fn test_sections_options_and_comments() {
        let ini = parse(
            "# cell description\n\
             [wordline]\n\
             L_g = 30e-9\n\
             ; spacer\n\
             L_spacer: 40e-9 - Barrier_width * 2\n\
             \n\
             [channel]\n\
             r_f=15e-9\n",
        )
        .unwrap();
        assert_eq!(ini.section_names().collect::<Vec<_>>(), vec!["wordline", "channel"]);
        assert_eq!(ini.get("wordline", "L_g").unwrap(), "30e-9");
        assert_eq!(ini.get("wordline", "l_g").unwrap(), "30e-9");
        assert_eq!(
            ini.get("wordline", "L_SPACER").unwrap(),
            "40e-9 - Barrier_width * 2"
        );
        assert_eq!(ini.get("channel", "r_f").unwrap(), "15e-9");
        assert!(ini.has_section("channel"));
        assert!(!ini.has_section("material"));
    }

    #[test]
    fn test_default_fallback_and_missing_keys() {
        let ini = parse("[DEFAULT]\nt_1 = 6e-9\n[channel]\nt_2 = 6e-9\n").unwrap();
        assert_eq!(ini.get("channel", "t_1").unwrap(), "6e-9");
        assert!(matches!(
            ini.get("channel", "t_3"),
            Err(ParamError::MissingOption { key, .. }) if key == "t_3"
        ));
        assert!(matches!(
            ini.get("material", "t_1"),
            Err(ParamError::MissingSection(s)) if s == "material"
        ));
    }

    #[test]
    fn test_continuation_lines_join() {
        let ini = parse("[material]\nepsilon_sio = 3.9 *\n    permittivity\n").unwrap();
        assert_eq!(ini.get("material", "epsilon_sio").unwrap(), "3.9 *\npermittivity");
    }

    #[rstest]
    #[case("L_g = 1\n", 1)]
    #[case("[a]\nx = 1\n[a]\n", 3)]
    #[case("[a]\nx = 1\nX = 2\n", 3)]
    #[case("[a]\njust text\n", 2)]
    #[case("[a\n", 1)]
    #[case("[a]\n = 3\n", 2)]
    fn test_malformed_input_reports_line(#[case] text: &str, #[case] expected_line: usize) {
        match parse(text) {
            Err(ParamError::Ini { line, .. }) => assert_eq!(line, expected_line),
            other => panic!("expected an INI error, got {:?}", other),
        }
    }
}
