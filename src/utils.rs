/// Parses a table cell into a number.
///
/// Accepts thousands separators, full-width digits, a leading currency sign and
/// accounting-style parentheses for negatives. Blank cells, dash placeholders and
/// anything with trailing text (e.g. "2024年", "15%") are not numbers.
pub fn parse_cell_number(raw: &str) -> Option<f64> {
    let mut text = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        let mapped = match ch {
            '０'..='９' => char::from_u32(ch as u32 - '０' as u32 + '0' as u32)?,
            '．' => '.',
            '－' => '-',
            '（' => '(',
            '）' => ')',
            ',' | '，' | ' ' | '\u{3000}' | '¥' | '￥' => continue,
            other => other,
        };
        text.push(mapped);
    }

    if text.is_empty() {
        return None;
    }

    let (negative, body) = if text.starts_with('(') && text.ends_with(')') && text.len() > 2 {
        (true, &text[1..text.len() - 1])
    } else {
        (false, text.as_str())
    };

    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == '-' || c == '+')
    {
        return None;
    }
    if !body.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let value = body.parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Rounds a canonical (wan) amount to six decimals to shed float noise from
/// unit conversion and column sums.
pub fn round_canonical(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

pub fn within_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance + f64::EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// Three-digit functional classification code, e.g. "201".
pub fn is_category_code(raw: &str) -> bool {
    let code = raw.trim();
    code.len() == 3 && code.chars().all(|c| c.is_ascii_digit())
}

pub fn numeric_cells(row: &[String]) -> Vec<(usize, f64)> {
    row.iter()
        .enumerate()
        .filter_map(|(idx, cell)| parse_cell_number(cell).map(|v| (idx, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cell_number_formats() {
        assert_eq!(parse_cell_number("1,234.50"), Some(1234.5));
        assert_eq!(parse_cell_number(" 100 "), Some(100.0));
        assert_eq!(parse_cell_number("１２３"), Some(123.0));
        assert_eq!(parse_cell_number("(12.5)"), Some(-12.5));
        assert_eq!(parse_cell_number("（3）"), Some(-3.0));
        assert_eq!(parse_cell_number("-7"), Some(-7.0));
        assert_eq!(parse_cell_number("￥88"), Some(88.0));
    }

    #[test]
    fn test_parse_cell_number_rejects_text() {
        assert_eq!(parse_cell_number(""), None);
        assert_eq!(parse_cell_number("-"), None);
        assert_eq!(parse_cell_number("—"), None);
        assert_eq!(parse_cell_number("2024年"), None);
        assert_eq!(parse_cell_number("15%"), None);
        assert_eq!(parse_cell_number("收入合计"), None);
        assert_eq!(parse_cell_number("1.2.3"), None);
    }

    #[test]
    fn test_within_tolerance_boundaries() {
        assert!(within_tolerance(100.0, 100.009, 0.01));
        assert!(within_tolerance(100.0, 100.01, 0.01));
        assert!(!within_tolerance(100.0, 100.011, 0.01));
    }

    #[test]
    fn test_round_canonical() {
        assert_eq!(round_canonical(0.1 + 0.2), 0.3);
        assert_eq!(round_canonical(1_000_000.0 / 10_000.0), 100.0);
    }

    #[test]
    fn test_category_code() {
        assert!(is_category_code("201"));
        assert!(is_category_code(" 208 "));
        assert!(!is_category_code("2010101"));
        assert!(!is_category_code("20a"));
    }
}
