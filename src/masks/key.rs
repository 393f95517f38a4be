//! Content-addressed mask keys.
//!
//! A key is the tile, the bake kind and an ordered parameter list. Its
//! canonical string is both the in-memory cache key and the disk filename, so
//! the format is fixed:
//!
//! ```text
//! {x}_{y}_{kind}[_{param}]*
//!   kind  : radius | layer | biome
//!   param : i{int} | f{float, 6 decimals} | s{text, [A-Za-z0-9-] only} | l{layer bits}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tile::TileId;

/// Which derived mask a bake produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BakeKind {
    /// Radius based collision mask around trees or tagged objects
    RadiusCollision,
    /// Orthographic collision bake of a set of layers
    LayerCollision,
    /// World biome mask cropped to the tile
    WorldBiome,
}

impl BakeKind {
    pub const ALL: [BakeKind; 3] = [BakeKind::RadiusCollision, BakeKind::LayerCollision, BakeKind::WorldBiome];

    pub fn token(&self) -> &'static str {
        match self {
            BakeKind::RadiusCollision => "radius",
            BakeKind::LayerCollision => "layer",
            BakeKind::WorldBiome => "biome",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        BakeKind::ALL.into_iter().find(|k| k.token() == token)
    }
}

/// One bake parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum MaskParam {
    Int(i64),
    Float(f64),
    /// Free text such as a spawn rule GUID or tag name. Must already be in
    /// `[A-Za-z0-9-]`: other characters are written as `-`, so texts that
    /// differ only there share a key.
    Text(String),
    /// Layer bit mask
    Layers(u32),
}

impl MaskParam {
    /// Text parameter, sanitized up front. Warns when the text changes.
    pub fn text(text: &str) -> Self {
        let clean = sanitize(text);
        if clean != text {
            warn!("Mask key text '{}' stored as '{}'", text, clean);
        }
        MaskParam::Text(clean)
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            MaskParam::Int(v) => {
                out.push('i');
                out.push_str(&v.to_string());
            }
            MaskParam::Float(v) => {
                // -0.0 and 0.0 must share a key
                let v = if *v == 0.0 { 0.0 } else { *v };
                out.push('f');
                out.push_str(&format!("{:.6}", v));
            }
            MaskParam::Text(s) => {
                out.push('s');
                out.push_str(&sanitize(s));
            }
            MaskParam::Layers(bits) => {
                out.push('l');
                out.push_str(&bits.to_string());
            }
        }
    }

    fn parse(token: &str) -> Option<Self> {
        let mut chars = token.chars();
        let tag = chars.next()?;
        let rest = chars.as_str();
        match tag {
            'i' => rest.parse().ok().map(MaskParam::Int),
            'f' => rest.parse().ok().map(MaskParam::Float),
            's' => Some(MaskParam::Text(rest.to_string())),
            'l' => rest.parse().ok().map(MaskParam::Layers),
            _ => None,
        }
    }
}

/// Replace anything outside `[A-Za-z0-9-]` with `-`.
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct MaskKey {
    pub tile: TileId,
    pub kind: BakeKind,
    pub params: Vec<MaskParam>,
}

impl MaskKey {
    pub fn new(tile: TileId, kind: BakeKind) -> Self {
        Self {
            tile,
            kind,
            params: Vec::new(),
        }
    }

    pub fn with(mut self, param: MaskParam) -> Self {
        self.params.push(param);
        self
    }

    /// Radius mask for a spawn rule: rule GUID, radius in meters.
    pub fn radius(tile: TileId, rule_guid: &str, radius: f64) -> Self {
        Self::new(tile, BakeKind::RadiusCollision)
            .with(MaskParam::text(rule_guid))
            .with(MaskParam::Float(radius))
    }

    /// Layer collision mask: layer bits, resolution.
    pub fn layers(tile: TileId, layers: u32, resolution: i64) -> Self {
        Self::new(tile, BakeKind::LayerCollision)
            .with(MaskParam::Layers(layers))
            .with(MaskParam::Int(resolution))
    }

    /// World biome mask: biome name, resolution.
    pub fn biome(tile: TileId, biome: &str, resolution: i64) -> Self {
        Self::new(tile, BakeKind::WorldBiome)
            .with(MaskParam::text(biome))
            .with(MaskParam::Int(resolution))
    }

    pub fn canonical(&self) -> String {
        let mut out = format!("{}_{}_{}", self.tile.x, self.tile.y, self.kind.token());
        for param in &self.params {
            out.push('_');
            param.write_canonical(&mut out);
        }
        out
    }

    /// Inverse of [`MaskKey::canonical`]. Text parameters come back in their
    /// sanitized form.
    pub fn parse(canonical: &str) -> Option<Self> {
        let mut parts = canonical.split('_');
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        let kind = BakeKind::from_token(parts.next()?)?;
        let params = parts.map(MaskParam::parse).collect::<Option<Vec<_>>>()?;
        Some(Self {
            tile: TileId::new(x, y),
            kind,
            params,
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}.png", self.canonical())
    }

    /// Number of rows/columns requested by the first integer parameter.
    pub fn resolution(&self) -> Option<usize> {
        self.params.iter().find_map(|p| match p {
            MaskParam::Int(v) if *v > 0 => Some(*v as usize),
            _ => None,
        })
    }

    pub fn text(&self) -> Option<&str> {
        self.params.iter().find_map(|p| match p {
            MaskParam::Text(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn float(&self) -> Option<f64> {
        self.params.iter().find_map(|p| match p {
            MaskParam::Float(v) => Some(*v),
            _ => None,
        })
    }

    pub fn layer_bits(&self) -> Option<u32> {
        self.params.iter().find_map(|p| match p {
            MaskParam::Layers(bits) => Some(*bits),
            _ => None,
        })
    }
}

impl fmt::Display for MaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// A dependency class of cache entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidationTag {
    /// Any key whose canonical form contains this fragment
    Fragment(String),
    Tile(TileId),
    Kind(BakeKind),
    /// Any key with a layer parameter that has this bit set
    LayerBit(u32),
}

impl InvalidationTag {
    /// Entries depending on a spawn rule GUID.
    pub fn spawn_rule(guid: &str) -> Self {
        InvalidationTag::Fragment(sanitize(guid))
    }

    pub fn matches(&self, key: &MaskKey) -> bool {
        match self {
            InvalidationTag::Fragment(fragment) => key.canonical().contains(fragment.as_str()),
            InvalidationTag::Tile(tile) => key.tile == *tile,
            InvalidationTag::Kind(kind) => key.kind == *kind,
            InvalidationTag::LayerBit(bit) => {
                *bit < 32
                    && key.params.iter().any(|p| match p {
                        MaskParam::Layers(bits) => bits & (1 << bit) != 0,
                        _ => false,
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_format() {
        let key = MaskKey::radius(TileId::new(-2, 7), "rule GUID/123", 12.5);
        assert_eq!(key.canonical(), "-2_7_radius_srule-GUID-123_f12.500000");
        assert_eq!(key.file_name(), "-2_7_radius_srule-GUID-123_f12.500000.png");

        let key = MaskKey::layers(TileId::new(0, 0), 0b1010, 256);
        assert_eq!(key.canonical(), "0_0_layer_l10_i256");
    }

    #[test]
    fn test_text_params_sanitized_on_construction() {
        let key = MaskKey::radius(TileId::new(0, 0), "rule.1", 1.0);
        assert_eq!(key.text(), Some("rule-1"));
        assert_eq!(key, MaskKey::radius(TileId::new(0, 0), "rule-1", 1.0));
        assert_eq!(MaskParam::text("boreal"), MaskParam::Text("boreal".into()));
    }

    #[test]
    fn test_negative_zero_shares_key() {
        let a = MaskKey::new(TileId::new(0, 0), BakeKind::WorldBiome).with(MaskParam::Float(-0.0));
        let b = MaskKey::new(TileId::new(0, 0), BakeKind::WorldBiome).with(MaskParam::Float(0.0));
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_parse_inverts_canonical() {
        let key = MaskKey::biome(TileId::new(3, -4), "temperate-forest", 64).with(MaskParam::Layers(5));
        let parsed = MaskKey::parse(&key.canonical()).unwrap();
        assert_eq!(parsed, key);
        assert!(MaskKey::parse("1_2_unknown").is_none());
        assert!(MaskKey::parse("1_2_radius_x9").is_none());
    }

    #[test]
    fn test_tag_matching() {
        let key = MaskKey::layers(TileId::new(1, 1), 0b0100, 128);
        assert!(InvalidationTag::LayerBit(2).matches(&key));
        assert!(!InvalidationTag::LayerBit(1).matches(&key));
        assert!(!InvalidationTag::LayerBit(40).matches(&key));
        assert!(InvalidationTag::Kind(BakeKind::LayerCollision).matches(&key));
        assert!(InvalidationTag::Tile(TileId::new(1, 1)).matches(&key));
        assert!(InvalidationTag::Fragment("_i128".into()).matches(&key));
    }
}
