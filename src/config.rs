use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::tool::Tool;

/// Immutable description of the font matrix: which families, regions and
/// styles exist and how they relate to each other.
///
/// The configuration is read once per run and validated as a whole, so
/// every lookup performed later by the pipeline can only fail on names that
/// come from outside the configuration (for example a CLI argument).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// File name prefix of every produced font and archive.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub family_order: Vec<String>,
    pub families: BTreeMap<String, Family>,
    pub region_order: Vec<String>,
    pub regions: BTreeMap<String, Region>,
    /// Upright and italic styles interleaved, the upright one first.
    pub style_order: Vec<String>,
    pub styles: BTreeMap<String, Style>,
    pub latin_groups: BTreeMap<String, LatinGroup>,
    pub source_container: ContainerLayout,
    #[serde(default)]
    pub options: BuildOptions,
    #[serde(default)]
    pub toolchain: Toolchain,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Family {
    pub latin_group: String,
    #[serde(default)]
    pub is_mono: bool,
    #[serde(default)]
    pub is_type: bool,
    #[serde(default, rename = "isPWID")]
    pub is_pwid: bool,
    #[serde(default)]
    pub is_term: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    /// Display name passed to the composite builder.
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Style {
    /// Upright equivalent of an italic style. `None` marks a canonical
    /// weight, which takes part in the hinting chain.
    #[serde(default)]
    pub upright_style_map: Option<String>,
    #[serde(default)]
    pub italic: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatinGroup {
    /// Sources are CFF outlines and need `otf2ttf` before use.
    #[serde(default)]
    pub is_cff: bool,
}

/// Layout of the multi-font source containers.
///
/// For weight `w` the container is `sources/shs/<container>-<weights[w]>.ttc`
/// and splitting it yields one `<parts[r]>-<weights[w]>.otf` per region `r`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerLayout {
    pub container: String,
    pub parts: BTreeMap<String, String>,
    pub weights: BTreeMap<String, String>,
}

/// How far extraction trusts the metrics found in the source fonts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsPolicy {
    /// Use the side bearings of the source as they are.
    #[default]
    Trust,
    /// Recompute side bearings from the outlines after extraction.
    Recompute,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    #[serde(default)]
    pub source_metrics: MetricsPolicy,
    /// Run `ttfautohint` at the end of pass 1 sanitation.
    #[serde(default)]
    pub autohint_pass1: bool,
}

/// External programs used by the pipeline, each with its fixed leading
/// arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Toolchain {
    pub otfcc_dump: Tool,
    pub otfcc_build: Tool,
    pub otc2otf: Tool,
    pub otf2otc: Tool,
    pub otf2ttf: Tool,
    pub ttx: Tool,
    pub ttfautohint: Tool,
    pub hinter: Tool,
    pub archiver: Tool,
    pub archive_args: Vec<String>,
    /// Interpreter running the glyph synthesis recipes.
    pub recipes: Tool,
    pub recipe_dir: String,
    pub recipe_ext: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            otfcc_dump: Tool::new("otfccdump"),
            otfcc_build: Tool::new("otfccbuild"),
            otc2otf: Tool::new("otc2otf"),
            otf2otc: Tool::new("otf2otc"),
            otf2ttf: Tool::new("otf2ttf"),
            ttx: Tool::new("ttx"),
            ttfautohint: Tool::new("ttfautohint"),
            hinter: Tool::new("chlorophytum"),
            archiver: Tool::new("7z"),
            archive_args: vec![
                "-t7z".into(),
                "-mmt=on".into(),
                "-m0=LZMA:a=0:d=1536m:fb=256".into(),
            ],
            recipes: Tool::new("node"),
            recipe_dir: "make".into(),
            recipe_ext: "js".into(),
        }
    }
}

fn default_prefix() -> String {
    "sarasa".into()
}

impl BuildConfig {
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        let config: BuildConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Checks every cross reference inside the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.family_order.is_empty() {
            return Err(ConfigError::Empty("Family"));
        }
        if self.region_order.is_empty() {
            return Err(ConfigError::Empty("Region"));
        }
        if self.style_order.is_empty() {
            return Err(ConfigError::Empty("Style"));
        }

        for name in &self.family_order {
            let family = self
                .families
                .get(name)
                .ok_or_else(|| ConfigError::UnknownFamily(name.clone()))?;

            if !self.latin_groups.contains_key(&family.latin_group) {
                return Err(ConfigError::UnknownLatinGroup {
                    family: name.clone(),
                    group: family.latin_group.clone(),
                });
            }
        }

        for name in &self.region_order {
            if !self.regions.contains_key(name) {
                return Err(ConfigError::UnknownRegion(name.clone()));
            }
            if !self.source_container.parts.contains_key(name) {
                return Err(ConfigError::MissingRegionPart(name.clone()));
            }
        }

        for name in &self.style_order {
            if !self.styles.contains_key(name) {
                return Err(ConfigError::UnknownStyle(name.clone()));
            }
        }

        for (name, style) in &self.styles {
            let Some(upright) = &style.upright_style_map else {
                continue;
            };

            match self.styles.get(upright) {
                None => {
                    return Err(ConfigError::UnknownUprightStyle {
                        style: name.clone(),
                        upright: upright.clone(),
                    });
                }
                Some(target) if target.upright_style_map.is_some() => {
                    return Err(ConfigError::ChainedUprightStyle {
                        style: name.clone(),
                        upright: upright.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        for name in &self.style_order {
            if let Some(upright) = &self.styles[name].upright_style_map
                && !self.style_order.contains(upright)
            {
                return Err(ConfigError::UnorderedUprightStyle {
                    style: name.clone(),
                    upright: upright.clone(),
                });
            }
        }

        // Archive batches pair each upright style with the italic after it.
        for pair in self.style_order.chunks(2) {
            let upright = &pair[0];
            if self.styles[upright].upright_style_map.is_some() {
                return Err(ConfigError::StylePairing {
                    found: upright.clone(),
                    expected: "an upright",
                });
            }
            if let Some(italic) = pair.get(1)
                && self.styles[italic].upright_style_map.as_ref() != Some(upright)
            {
                return Err(ConfigError::StylePairing {
                    found: italic.clone(),
                    expected: "an italic",
                });
            }
        }

        for weight in self.hint_chain() {
            if !self.source_container.weights.contains_key(weight) {
                return Err(ConfigError::MissingWeightSuffix(weight.to_string()));
            }
        }

        Ok(())
    }

    /// Canonical weight of a style: its upright equivalent if it has one,
    /// otherwise the style itself.
    pub fn deitalized<'a>(&'a self, style: &'a str) -> &'a str {
        self.styles
            .get(style)
            .and_then(|s| s.upright_style_map.as_deref())
            .unwrap_or(style)
    }

    /// Whether pass 1 has to synthesize italics for this style.
    pub fn is_italized(&self, style: &str) -> bool {
        self.deitalized(style) != style
            || self.styles.get(style).is_some_and(|s| s.italic)
    }

    /// The weight chain: canonical styles in style order.
    pub fn hint_chain(&self) -> Vec<&str> {
        self.style_order
            .iter()
            .filter(|name| {
                self.styles
                    .get(name.as_str())
                    .is_some_and(|s| s.upright_style_map.is_none())
            })
            .map(String::as_str)
            .collect()
    }

    /// Style order cut into (upright, italic) pairs.
    pub fn style_pairs(&self) -> Vec<(&str, Option<&str>)> {
        self.style_order
            .chunks(2)
            .map(|pair| (pair[0].as_str(), pair.get(1).map(String::as_str)))
            .collect()
    }

    pub fn family(&self, name: &str) -> Result<&Family, ConfigError> {
        self.families.get(name).ok_or_else(|| unknown("family", name))
    }

    pub fn region(&self, name: &str) -> Result<&Region, ConfigError> {
        self.regions.get(name).ok_or_else(|| unknown("region", name))
    }

    pub fn style(&self, name: &str) -> Result<&Style, ConfigError> {
        self.styles.get(name).ok_or_else(|| unknown("style", name))
    }

    pub fn latin_group(&self, name: &str) -> Result<&LatinGroup, ConfigError> {
        self.latin_groups
            .get(name)
            .ok_or_else(|| unknown("latin group", name))
    }

    pub fn weight_suffix(&self, weight: &str) -> Result<&str, ConfigError> {
        self.source_container
            .weights
            .get(weight)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingWeightSuffix(weight.to_string()))
    }

    pub fn region_part(&self, region: &str) -> Result<&str, ConfigError> {
        self.source_container
            .parts
            .get(region)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingRegionPart(region.to_string()))
    }
}

fn unknown(kind: &'static str, name: &str) -> ConfigError {
    ConfigError::Unknown {
        kind,
        name: name.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"{
        "prefix": "sarasa",
        "familyOrder": ["gothic"],
        "families": { "gothic": { "latinGroup": "inter" } },
        "regionOrder": ["sc"],
        "regions": { "sc": { "name": "SC" } },
        "styleOrder": ["regular", "italic"],
        "styles": {
            "regular": {},
            "italic": { "uprightStyleMap": "regular", "italic": true }
        },
        "latinGroups": { "inter": {} },
        "sourceContainer": {
            "container": "SourceHanSans",
            "parts": { "sc": "SourceHanSansSC" },
            "weights": { "regular": "Regular" }
        }
    }"#;

    pub(crate) const TWO_WEIGHTS: &str = r#"{
        "prefix": "sarasa",
        "familyOrder": ["gothic", "mono"],
        "families": {
            "gothic": { "latinGroup": "inter" },
            "mono": { "latinGroup": "iosevka", "isMono": true, "isTerm": true }
        },
        "regionOrder": ["sc", "j"],
        "regions": { "sc": { "name": "SC" }, "j": { "name": "J" } },
        "styleOrder": ["light", "lightitalic", "regular", "italic", "bold", "bolditalic"],
        "styles": {
            "light": {},
            "lightitalic": { "uprightStyleMap": "light", "italic": true },
            "regular": {},
            "italic": { "uprightStyleMap": "regular", "italic": true },
            "bold": {},
            "bolditalic": { "uprightStyleMap": "bold", "italic": true }
        },
        "latinGroups": { "inter": {}, "iosevka": { "isCff": true } },
        "sourceContainer": {
            "container": "SourceHanSans",
            "parts": { "sc": "SourceHanSansSC", "j": "SourceHanSans" },
            "weights": { "light": "Light", "regular": "Regular", "bold": "Bold" }
        }
    }"#;

    pub(crate) fn parse(text: &str) -> BuildConfig {
        let config: BuildConfig = serde_json::from_str(text).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_minimal_config() {
        let config = parse(MINIMAL);
        assert_eq!(config.prefix, "sarasa");
        assert_eq!(config.hint_chain(), vec!["regular"]);
        assert_eq!(config.options.source_metrics, MetricsPolicy::Trust);
        assert_eq!(config.toolchain.otfcc_build.program, "otfccbuild");
    }

    #[test]
    fn test_deitalized_is_idempotent() {
        let config = parse(TWO_WEIGHTS);
        for style in &config.style_order {
            let once = config.deitalized(style);
            assert_eq!(config.deitalized(once), once);
        }
        assert_eq!(config.deitalized("bolditalic"), "bold");
        assert_eq!(config.deitalized("bold"), "bold");
        assert_eq!(config.deitalized("unknown"), "unknown");
    }

    #[test]
    fn test_italized() {
        let config = parse(TWO_WEIGHTS);
        assert!(config.is_italized("italic"));
        assert!(!config.is_italized("regular"));
    }

    #[test]
    fn test_hint_chain_follows_style_order() {
        let config = parse(TWO_WEIGHTS);
        assert_eq!(config.hint_chain(), vec!["light", "regular", "bold"]);
    }

    #[test]
    fn test_style_pairs() {
        let config = parse(MINIMAL);
        assert_eq!(config.style_pairs(), vec![("regular", Some("italic"))]);
    }

    #[test]
    fn test_unknown_upright_style() {
        let text = MINIMAL.replace(r#""uprightStyleMap": "regular""#, r#""uprightStyleMap": "book""#);
        let config: BuildConfig = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownUprightStyle { .. })
        ));
    }

    #[test]
    fn test_unknown_latin_group() {
        let text = MINIMAL.replace(r#""latinGroup": "inter""#, r#""latinGroup": "roboto""#);
        let config: BuildConfig = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownLatinGroup { .. })
        ));
    }

    #[test]
    fn test_chained_upright_style_is_rejected() {
        let mut config = parse(MINIMAL);
        config.styles.insert(
            "obliqueitalic".into(),
            Style {
                upright_style_map: Some("italic".into()),
                italic: true,
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ChainedUprightStyle { .. })
        ));
    }

    #[test]
    fn test_upright_target_must_be_ordered() {
        let text = MINIMAL.replace(r#""styleOrder": ["regular", "italic"]"#, r#""styleOrder": ["italic"]"#);
        let config: BuildConfig = serde_json::from_str(&text).unwrap();
        match config.validate() {
            Err(ConfigError::UnorderedUprightStyle { style, upright }) => {
                assert_eq!(style, "italic");
                assert_eq!(upright, "regular");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_style_order_alternates() {
        let text = TWO_WEIGHTS.replace(
            r#"["light", "lightitalic", "regular", "italic", "bold", "bolditalic"]"#,
            r#"["light", "regular", "lightitalic", "italic", "bold", "bolditalic"]"#,
        );
        let config: BuildConfig = serde_json::from_str(&text).unwrap();
        match config.validate() {
            Err(ConfigError::StylePairing { found, .. }) => assert_eq!(found, "regular"),
            other => panic!("unexpected result: {other:?}"),
        }

        let text = MINIMAL.replace(r#""styleOrder": ["regular", "italic"]"#, r#""styleOrder": ["regular"]"#);
        let config: BuildConfig = serde_json::from_str(&text).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_weight_suffix() {
        let text = MINIMAL.replace(r#""weights": { "regular": "Regular" }"#, r#""weights": {}"#);
        let config: BuildConfig = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingWeightSuffix(_))
        ));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        match BuildConfig::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
