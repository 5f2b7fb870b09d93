//! ラベル分布の集計

use std::collections::HashMap;

use crate::types::{CardRecord, ColorLabel, MetadataRow};

/// 色の組み合わせごとの枚数（組み合わせの色数 → 名前順）
pub fn combination_counts(cards: &[CardRecord]) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for card in cards {
        let entry = counts
            .entry(card.color_identity.combination_key())
            .or_insert((card.color_identity.len(), 0));
        entry.1 += 1;
    }

    let mut sorted: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(key, (size, count))| (key, size, count))
        .collect();
    sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    sorted.into_iter().map(|(key, _, count)| (key, count)).collect()
}

/// ラベルごとの枚数（クラスID順、0枚のラベルも含む）
pub fn label_counts(rows: &[MetadataRow]) -> Vec<(ColorLabel, usize)> {
    ColorLabel::ALL
        .iter()
        .map(|label| (*label, rows.iter().filter(|r| r.label == *label).count()))
        .collect()
}

pub fn print_counts<K: std::fmt::Display>(title: &str, counts: &[(K, usize)]) {
    let total: usize = counts.iter().map(|(_, c)| c).sum();
    println!("\n=== {} ===", title);
    for (key, count) in counts {
        let ratio = if total == 0 { 0.0 } else { *count as f64 / total as f64 * 100.0 };
        println!("{:<12} {:>6} ({:5.1}%)", key.to_string(), count, ratio);
    }
    println!("{:<12} {:>6}", "合計", total);
}
