//! カードカタログ・メタデータ・推論結果の共通型

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// カードの色（WUBRG順）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Color {
    White,
    Blue,
    Black,
    Red,
    Green,
}

impl Color {
    /// WUBRG順の全色
    pub const ALL: [Color; 5] = [Color::White, Color::Blue, Color::Black, Color::Red, Color::Green];

    /// 1文字の色記号
    pub fn symbol(self) -> char {
        match self {
            Color::White => 'W',
            Color::Blue => 'U',
            Color::Black => 'B',
            Color::Red => 'R',
            Color::Green => 'G',
        }
    }

    pub fn from_symbol(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'W' => Some(Color::White),
            'U' => Some(Color::Blue),
            'B' => Some(Color::Black),
            'R' => Some(Color::Red),
            'G' => Some(Color::Green),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "white" => Some(Color::White),
            "blue" => Some(Color::Blue),
            "black" => Some(Color::Black),
            "red" => Some(Color::Red),
            "green" => Some(Color::Green),
            _ => None,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// カラーアイデンティティ（0〜5色の集合、WUBRG順で重複なし）
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ColorIdentity(Vec<Color>);

impl ColorIdentity {
    pub fn new(colors: impl IntoIterator<Item = Color>) -> Self {
        let mut colors: Vec<Color> = colors.into_iter().collect();
        colors.sort();
        colors.dedup();
        Self(colors)
    }

    pub fn colorless() -> Self {
        Self(Vec::new())
    }

    pub fn colors(&self) -> &[Color] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 色の組み合わせを記号列で表す（無色は"Colorless"）
    ///
    /// 例: `{W, U}` -> `"WU"`
    pub fn combination_key(&self) -> String {
        if self.0.is_empty() {
            return "Colorless".to_string();
        }
        self.0.iter().map(|c| c.symbol()).collect()
    }
}

impl fmt::Display for ColorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbols: Vec<String> = self.0.iter().map(|c| c.symbol().to_string()).collect();
        write!(f, "{}", symbols.join(","))
    }
}

impl FromStr for ColorIdentity {
    type Err = PipelineError;

    /// 表記ゆれを許容して解析する
    ///
    /// `"W,U"`, `"['W', 'U']"`, `"WU"`, `"White, Blue"`, `"Colorless"`, `""` などを受け付ける。
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s
            .chars()
            .filter(|c| !matches!(c, '[' | ']' | '\'' | '"' | ' '))
            .collect();

        let mut colors = Vec::new();
        for token in cleaned.split(',') {
            if token.is_empty() || token.eq_ignore_ascii_case("colorless") || token.eq_ignore_ascii_case("c") {
                continue;
            }
            if let Some(color) = Color::from_name(token) {
                colors.push(color);
                continue;
            }
            // "WU" のような連結表記は1文字ずつ分解
            let parsed: Option<Vec<Color>> = token.chars().map(Color::from_symbol).collect();
            match parsed {
                Some(symbols) => colors.extend(symbols),
                None => {
                    return Err(PipelineError::InvalidInput(format!(
                        "不明な色表記です: '{}'",
                        token
                    )))
                }
            }
        }

        Ok(Self::new(colors))
    }
}

impl Serialize for ColorIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ColorIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// 学習用の色ラベル（クラスIDは `ALL` の並び順）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorLabel {
    White,
    Blue,
    Black,
    Red,
    Green,
    Colorless,
    Multicolor,
}

impl ColorLabel {
    /// クラスID順の全ラベル
    pub const ALL: [ColorLabel; 7] = [
        ColorLabel::White,
        ColorLabel::Blue,
        ColorLabel::Black,
        ColorLabel::Red,
        ColorLabel::Green,
        ColorLabel::Colorless,
        ColorLabel::Multicolor,
    ];

    /// カラーアイデンティティからラベルを決定
    ///
    /// - 0色: Colorless
    /// - 1色: その色
    /// - 2色以上: Multicolor
    pub fn from_identity(identity: &ColorIdentity) -> Self {
        match identity.colors() {
            [] => ColorLabel::Colorless,
            [single] => ColorLabel::from(*single),
            _ => ColorLabel::Multicolor,
        }
    }

    pub fn class_id(self) -> usize {
        ColorLabel::ALL
            .iter()
            .position(|l| *l == self)
            .unwrap_or(ColorLabel::ALL.len() - 1)
    }

    pub fn from_class_id(id: usize) -> Option<Self> {
        ColorLabel::ALL.get(id).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColorLabel::White => "White",
            ColorLabel::Blue => "Blue",
            ColorLabel::Black => "Black",
            ColorLabel::Red => "Red",
            ColorLabel::Green => "Green",
            ColorLabel::Colorless => "Colorless",
            ColorLabel::Multicolor => "Multicolor",
        }
    }

    /// クラス順のラベル名一覧（モデルメタデータ用）
    pub fn class_names() -> Vec<String> {
        ColorLabel::ALL.iter().map(|l| l.as_str().to_string()).collect()
    }
}

impl From<Color> for ColorLabel {
    fn from(color: Color) -> Self {
        match color {
            Color::White => ColorLabel::White,
            Color::Blue => ColorLabel::Blue,
            Color::Black => ColorLabel::Black,
            Color::Red => ColorLabel::Red,
            Color::Green => ColorLabel::Green,
        }
    }
}

impl fmt::Display for ColorLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorLabel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ColorLabel::ALL
            .iter()
            .copied()
            .find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::InvalidInput(format!("不明なラベルです: '{}'", s)))
    }
}

/// カタログの1行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    pub name: String,
    pub color_identity: ColorIdentity,
    #[serde(default)]
    pub image_url: String,
}

/// メタデータの1行（画像ファイル名とラベル）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub image_filename: String,
    pub label: ColorLabel,
}

/// 推論結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub image_filename: String,
    pub predicted_label: ColorLabel,
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(s: &str) -> ColorIdentity {
        s.parse().unwrap()
    }

    #[test]
    fn test_label_rule() {
        assert_eq!(ColorLabel::from_identity(&ColorIdentity::colorless()), ColorLabel::Colorless);
        for color in Color::ALL {
            assert_eq!(
                ColorLabel::from_identity(&ColorIdentity::new([color])),
                ColorLabel::from(color)
            );
        }
        for n in 2..=5 {
            let id = ColorIdentity::new(Color::ALL.iter().copied().take(n));
            assert_eq!(ColorLabel::from_identity(&id), ColorLabel::Multicolor);
        }
    }

    #[test]
    fn test_identity_parsing_variants() {
        assert_eq!(identity("W,U"), ColorIdentity::new([Color::White, Color::Blue]));
        assert_eq!(identity("['U', 'W']"), ColorIdentity::new([Color::White, Color::Blue]));
        assert_eq!(identity("RU"), ColorIdentity::new([Color::Red, Color::Blue]));
        assert_eq!(identity("white, green"), ColorIdentity::new([Color::White, Color::Green]));
        assert!(identity("Colorless").is_empty());
        assert!(identity("").is_empty());
        assert!("X".parse::<ColorIdentity>().is_err());
    }

    #[test]
    fn test_identity_is_normalized() {
        let id = identity("G,W,G,B");
        assert_eq!(id.to_string(), "W,B,G");
        assert_eq!(id.combination_key(), "WBG");
        assert_eq!(ColorIdentity::colorless().combination_key(), "Colorless");
    }

    #[test]
    fn test_class_id_round_trip() {
        for (i, label) in ColorLabel::ALL.iter().enumerate() {
            assert_eq!(label.class_id(), i);
            assert_eq!(ColorLabel::from_class_id(i), Some(*label));
        }
        assert_eq!(ColorLabel::from_class_id(7), None);
        assert_eq!("multicolor".parse::<ColorLabel>().unwrap(), ColorLabel::Multicolor);
    }
}
