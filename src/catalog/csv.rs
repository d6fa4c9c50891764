//! Delimited catalog text: comma separated, `"`-quoted fields with `""` escapes.

use std::collections::BTreeSet;

use super::normalize::normalize;
use super::ProductRecord;
use crate::error::ShopChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Name,
    Price,
    Unit,
    Aliases,
    Tags,
    Specification,
    PcsPerBundle,
}

const HEADER_SYNONYMS: &[(Column, &[&str])] = &[
    (
        Column::Name,
        &["name", "product", "product_name", "item", "ชื่อ", "ชื่อสินค้า", "สินค้า", "รายการ"],
    ),
    (Column::Price, &["price", "unit_price", "ราคา", "ราคาต่อหน่วย", "ราคา(บาท)"]),
    (Column::Unit, &["unit", "uom", "หน่วย", "หน่วยนับ"]),
    (
        Column::Aliases,
        &["alias", "aliases", "keywords", "ชื่อเรียก", "ชื่อเรียกอื่น", "ชื่ออื่น", "คำค้น"],
    ),
    (Column::Tags, &["tag", "tags", "category", "แท็ก", "หมวด", "หมวดหมู่", "ประเภท"]),
    (
        Column::Specification,
        &["spec", "specs", "specification", "size", "ขนาด", "สเปค", "รายละเอียด"],
    ),
    (
        Column::PcsPerBundle,
        &["pcs_per_bundle", "per_bundle", "bundle", "bundle_size", "จำนวนต่อมัด", "ต่อมัด", "มัดละ"],
    ),
];

fn classify_header(cell: &str) -> Option<Column> {
    let key = normalize(cell);
    if key.is_empty() {
        return None;
    }
    HEADER_SYNONYMS
        .iter()
        .find(|(_, names)| names.iter().any(|n| normalize(n) == key))
        .map(|(column, _)| *column)
}

/// Splits delimited text into rows of fields. Quoted fields may span lines.
pub fn parse_rows(text: &str) -> Result<Vec<Vec<String>>, ShopChatError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
            }
            ',' => row.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(ShopChatError::CatalogLoad(
            "unterminated quoted field".into(),
        ));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| r.iter().any(|f| !f.trim().is_empty()));
    Ok(rows)
}

fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .replace("บาท", "")
        .chars()
        .filter(|c| !matches!(c, ',' | '฿' | '$') && !c.is_whitespace())
        .collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite() && *p >= 0.0)
}

fn parse_bundle(raw: &str) -> Option<u32> {
    let digits: String = raw
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u32>().ok().filter(|n| *n > 0)
}

fn parse_list(raw: &str) -> BTreeSet<String> {
    raw.split(['|', ';', ','])
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn optional(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn cell(row: &[String], idx: Option<usize>) -> &str {
    idx.and_then(|i| row.get(i)).map(String::as_str).unwrap_or("")
}

/// Parses catalog text into product records in source order.
pub fn parse_catalog(text: &str) -> Result<Vec<ProductRecord>, ShopChatError> {
    let mut rows = parse_rows(text)?.into_iter();
    let header = rows
        .next()
        .ok_or_else(|| ShopChatError::CatalogLoad("catalog has no header row".into()))?;

    let columns: Vec<Option<Column>> = header.iter().map(|h| classify_header(h)).collect();
    let index_of = |wanted: Column| columns.iter().position(|c| *c == Some(wanted));
    let name_idx = index_of(Column::Name).ok_or_else(|| {
        ShopChatError::CatalogLoad(format!(
            "no product name column among headers: {}",
            header.join(", ")
        ))
    })?;
    let price_idx = index_of(Column::Price);
    let unit_idx = index_of(Column::Unit);
    let alias_idx = index_of(Column::Aliases);
    let tags_idx = index_of(Column::Tags);
    let spec_idx = index_of(Column::Specification);
    let bundle_idx = index_of(Column::PcsPerBundle);

    let mut products = Vec::new();
    for row in rows {
        let name = cell(&row, Some(name_idx)).trim();
        if name.is_empty() {
            continue;
        }
        products.push(ProductRecord::new(
            name.to_string(),
            parse_price(cell(&row, price_idx)),
            optional(cell(&row, unit_idx)),
            parse_list(cell(&row, alias_idx)),
            parse_list(cell(&row, tags_idx)),
            optional(cell(&row, spec_idx)),
            parse_bundle(cell(&row, bundle_idx)),
        ));
    }
    Ok(products)
}
