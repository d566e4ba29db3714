use crate::error::ImportError;
use crate::models::{CatalogRecord, ImageRecord, ProductOption, VariantRecord};
use crate::shopify::ByteStream;
use bytes::BytesMut;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// A fully assembled product and the byte range of the lines it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub record: CatalogRecord,
    pub start_offset: u64,
    /// Offset just past the record's last line; resuming here never replays it.
    pub end_offset: u64,
}

pub struct RecordStream {
    bytes: ByteStream,
    pending: BytesMut,
    scanned: usize,
    offset: u64,
    assembler: RecordAssembler,
    exhausted: bool,
    done: bool,
}

impl RecordStream {
    /// `base_offset` is the absolute position of the first byte `bytes` yields.
    pub fn new(bytes: ByteStream, base_offset: u64, max_children: usize) -> Self {
        Self {
            bytes,
            pending: BytesMut::new(),
            scanned: 0,
            offset: base_offset,
            assembler: RecordAssembler::new(max_children),
            exhausted: false,
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<ParsedRecord, ImportError>> {
        if self.done {
            return None;
        }
        loop {
            if let Some(pos) = self.pending[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
            {
                let line = self.pending.split_to(self.scanned + pos + 1);
                self.scanned = 0;
                let start = self.offset;
                self.offset += line.len() as u64;
                match self.assembler.push_line(&line[..line.len() - 1], start) {
                    Ok(Some(record)) => return Some(Ok(record)),
                    Ok(None) => continue,
                    Err(err) => return self.stop(err),
                }
            }
            self.scanned = self.pending.len();

            if self.exhausted {
                if !self.pending.is_empty() {
                    let line = self.pending.split();
                    self.scanned = 0;
                    let start = self.offset;
                    self.offset += line.len() as u64;
                    match self.assembler.push_line(&line, start) {
                        Ok(Some(record)) => return Some(Ok(record)),
                        Ok(None) => {}
                        Err(err) => return self.stop(err),
                    }
                }
                self.done = true;
                return self.assembler.finish(self.offset).map(Ok);
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => self.pending.extend_from_slice(&chunk),
                Some(Err(err)) => return self.stop(err),
                None => self.exhausted = true,
            }
        }
    }

    fn stop(&mut self, err: ImportError) -> Option<Result<ParsedRecord, ImportError>> {
        self.done = true;
        Some(Err(err))
    }
}

#[derive(Debug, Deserialize)]
struct ExportLine {
    id: String,
    #[serde(rename = "__parentId", default)]
    parent_id: Option<String>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProductFields {
    title: Option<String>,
    description: Option<String>,
    product_type: Option<String>,
    vendor: Option<String>,
    status: Option<String>,
    tags: Vec<String>,
    options: Vec<OptionFields>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OptionFields {
    name: String,
    values: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VariantFields {
    sku: Option<String>,
    title: Option<String>,
    price: Option<Value>,
    compare_at_price: Option<Value>,
    inventory_quantity: Option<i64>,
    inventory_item: Option<InventoryItemFields>,
    weight: Option<f64>,
    weight_unit: Option<String>,
    option1: Option<String>,
    option2: Option<String>,
    option3: Option<String>,
    selected_options: Vec<SelectedOption>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InventoryItemFields {
    measurement: Option<MeasurementFields>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MeasurementFields {
    weight: Option<WeightFields>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WeightFields {
    unit: Option<String>,
    value: Option<f64>,
}

impl VariantFields {
    // Older API versions export flat `weight`/`weightUnit`.
    fn weight(&mut self) -> (Option<f64>, Option<String>) {
        let measured = self
            .inventory_item
            .take()
            .and_then(|item| item.measurement)
            .and_then(|measurement| measurement.weight);
        match measured {
            Some(weight) => (weight.value, weight.unit),
            None => (self.weight, self.weight_unit.take()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SelectedOption {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ImageFields {
    src: Option<String>,
    url: Option<String>,
    alt_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildKind {
    Variant,
    Image,
    Other,
}

fn child_kind(gid: &str) -> ChildKind {
    let resource = gid
        .strip_prefix("gid://")
        .and_then(|rest| rest.split('/').nth(1))
        .unwrap_or("");
    match resource {
        "ProductVariant" => ChildKind::Variant,
        "ProductImage" | "MediaImage" | "Image" => ChildKind::Image,
        _ => ChildKind::Other,
    }
}

/// ERP unit-of-measure name for a provider weight unit.
pub fn weight_uom(unit: &str) -> Option<&'static str> {
    match unit.trim().to_ascii_uppercase().as_str() {
        "GRAMS" | "G" => Some("Gram"),
        "KILOGRAMS" | "KG" => Some("Kg"),
        "POUNDS" | "LB" => Some("Pound"),
        "OUNCES" | "OZ" => Some("Ounce"),
        _ => None,
    }
}

fn money(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => obj
            .get("amount")
            .and_then(|amount| money(Some(amount.clone()))),
        _ => None,
    }
}

struct OpenProduct {
    record: CatalogRecord,
    start_offset: u64,
    children: usize,
}

pub(crate) struct RecordAssembler {
    current: Option<OpenProduct>,
    seen: HashSet<String>,
    max_children: usize,
}

impl RecordAssembler {
    pub(crate) fn new(max_children: usize) -> Self {
        Self {
            current: None,
            seen: HashSet::new(),
            max_children,
        }
    }

    pub(crate) fn push_line(
        &mut self,
        raw: &[u8],
        start: u64,
    ) -> Result<Option<ParsedRecord>, ImportError> {
        let trimmed = raw.trim_ascii();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let line: ExportLine = serde_json::from_slice(trimmed)
            .map_err(|err| ImportError::malformed(start, format!("invalid json line: {err}")))?;

        let Some(parent_id) = line.parent_id else {
            if !self.seen.insert(line.id.clone()) {
                return Err(ImportError::malformed(
                    start,
                    format!("product {} appears more than once", line.id),
                ));
            }
            let opened = OpenProduct {
                record: product_record(line.id, line.fields, start)?,
                start_offset: start,
                children: 0,
            };
            return Ok(self.current.replace(opened).map(|closed| ParsedRecord {
                record: closed.record,
                start_offset: closed.start_offset,
                end_offset: start,
            }));
        };

        let max_children = self.max_children;
        match self.current.as_mut() {
            Some(open) if open.record.product_id == parent_id => {
                open.children += 1;
                if open.children > max_children {
                    return Err(ImportError::malformed(
                        start,
                        format!("product {parent_id} exceeds {max_children} child lines"),
                    ));
                }
                attach_child(&mut open.record, line.id, line.fields, start)?;
                Ok(None)
            }
            _ if self.seen.contains(&parent_id) => Err(ImportError::malformed(
                start,
                format!("child {} of {parent_id} arrived after its parent was closed", line.id),
            )),
            _ => Err(ImportError::malformed(
                start,
                format!("child {} references unknown parent {parent_id}", line.id),
            )),
        }
    }

    pub(crate) fn finish(&mut self, end: u64) -> Option<ParsedRecord> {
        self.current.take().map(|open| ParsedRecord {
            record: open.record,
            start_offset: open.start_offset,
            end_offset: end,
        })
    }
}

fn product_record(
    id: String,
    fields: Map<String, Value>,
    offset: u64,
) -> Result<CatalogRecord, ImportError> {
    let fields: ProductFields = serde_json::from_value(Value::Object(fields))
        .map_err(|err| ImportError::malformed(offset, format!("product {id}: {err}")))?;
    Ok(CatalogRecord {
        title: fields.title.unwrap_or_default(),
        description: fields.description.filter(|d| !d.is_empty()),
        product_type: fields.product_type.filter(|t| !t.is_empty()),
        vendor: fields.vendor,
        status: fields.status,
        tags: fields.tags,
        options: fields
            .options
            .into_iter()
            .map(|opt| ProductOption {
                name: opt.name,
                values: opt.values,
            })
            .collect(),
        variants: Vec::new(),
        images: Vec::new(),
        product_id: id,
    })
}

fn attach_child(
    record: &mut CatalogRecord,
    id: String,
    fields: Map<String, Value>,
    offset: u64,
) -> Result<(), ImportError> {
    match child_kind(&id) {
        ChildKind::Variant => {
            let mut fields: VariantFields = serde_json::from_value(Value::Object(fields))
                .map_err(|err| ImportError::malformed(offset, format!("variant {id}: {err}")))?;
            let (weight, weight_unit) = fields.weight();
            record.variants.push(VariantRecord {
                variant_id: id,
                sku: fields.sku.filter(|s| !s.is_empty()),
                title: fields.title,
                price: money(fields.price),
                compare_at_price: money(fields.compare_at_price),
                inventory_quantity: fields.inventory_quantity,
                weight,
                weight_uom: weight_unit
                    .as_deref()
                    .and_then(weight_uom)
                    .map(str::to_string),
                option_values: if fields.selected_options.is_empty() {
                    [fields.option1, fields.option2, fields.option3]
                        .into_iter()
                        .flatten()
                        .collect()
                } else {
                    fields
                        .selected_options
                        .into_iter()
                        .map(|opt| opt.value)
                        .collect()
                },
            });
        }
        ChildKind::Image => {
            let fields: ImageFields = serde_json::from_value(Value::Object(fields))
                .map_err(|err| ImportError::malformed(offset, format!("image {id}: {err}")))?;
            record.images.push(ImageRecord {
                image_id: id,
                src: fields.src.or(fields.url),
                alt_text: fields.alt_text,
            });
        }
        ChildKind::Other => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{chunked, sample_export};

    async fn collect(bytes: ByteStream, base: u64) -> Vec<Result<ParsedRecord, ImportError>> {
        let mut stream = RecordStream::new(bytes, base, 1_000);
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn assembles_parents_with_all_children() {
        let export = sample_export();
        let records: Vec<_> = collect(chunked(export.clone(), 4096), 0)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(records.len(), 2);
        let p1 = &records[0].record;
        assert_eq!(p1.product_id, "gid://shopify/Product/1");
        assert_eq!(p1.variants.len(), 2);
        assert_eq!(p1.images.len(), 0);
        assert_eq!(p1.variants[0].sku.as_deref(), Some("MUG-RED"));
        assert_eq!(p1.variants[0].weight_uom.as_deref(), Some("Kg"));
        assert_eq!(p1.variants[1].price.as_deref(), Some("12.50"));
        let p2 = &records[1].record;
        assert_eq!(p2.variants.len(), 1);
        assert_eq!(records[1].end_offset, export.len() as u64);
        assert_eq!(records[0].end_offset, records[1].start_offset);
    }

    #[tokio::test]
    async fn chunk_boundaries_do_not_change_the_result() {
        let export = sample_export();
        let reference: Vec<_> = collect(chunked(export.clone(), export.len()), 0)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        for size in 1..=export.len() {
            let got: Vec<_> = collect(chunked(export.clone(), size), 0)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();
            assert_eq!(got, reference, "chunk size {size}");
        }
    }

    #[tokio::test]
    async fn child_after_boundary_is_rejected() {
        let export = concat!(
            r#"{"id":"gid://shopify/Product/1","title":"A"}"#,
            "\n",
            r#"{"id":"gid://shopify/ProductVariant/11","__parentId":"gid://shopify/Product/1"}"#,
            "\n",
            r#"{"id":"gid://shopify/Product/2","title":"B"}"#,
            "\n",
            r#"{"id":"gid://shopify/ProductVariant/12","__parentId":"gid://shopify/Product/1"}"#,
            "\n",
        );
        let out = collect(chunked(export.as_bytes().to_vec(), 7), 0).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().record.variants.len(), 1);
        match &out[1] {
            Err(ImportError::MalformedExport { offset, message }) => {
                let expected = export.rfind(r#"{"id":"gid://shopify/ProductVariant/12""#).unwrap();
                assert_eq!(*offset, expected as u64);
                assert!(message.contains("after its parent was closed"), "{message}");
            }
            other => panic!("expected malformed export, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn orphans_duplicates_and_garbage_are_rejected() {
        let orphan = concat!(
            r#"{"id":"gid://shopify/ProductVariant/9","__parentId":"gid://shopify/Product/9"}"#,
            "\n"
        );
        let out = collect(chunked(orphan.as_bytes().to_vec(), 64), 0).await;
        assert!(matches!(&out[0], Err(ImportError::MalformedExport { message, .. }) if message.contains("unknown parent")));

        let duplicate = concat!(
            r#"{"id":"gid://shopify/Product/1"}"#,
            "\n",
            r#"{"id":"gid://shopify/Product/1"}"#,
            "\n"
        );
        let out = collect(chunked(duplicate.as_bytes().to_vec(), 64), 0).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Err(ImportError::MalformedExport { message, .. }) if message.contains("more than once")));

        let first = "{\"id\":\"gid://shopify/Product/1\"}\n";
        let garbage = format!("{first}not json\n").into_bytes();
        let out = collect(chunked(garbage, 5), 100).await;
        assert_eq!(out.len(), 1);
        let expected = 100 + first.len() as u64;
        assert!(matches!(&out[0], Err(ImportError::MalformedExport { offset, .. }) if *offset == expected));
    }

    #[tokio::test]
    async fn stream_stops_after_the_first_error() {
        let garbage = b"nope\n{\"id\":\"gid://shopify/Product/1\"}\n".to_vec();
        let mut stream = RecordStream::new(chunked(garbage, 3), 0, 10);
        assert!(matches!(stream.next().await, Some(Err(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn child_ceiling_is_enforced() {
        let mut export = String::from("{\"id\":\"gid://shopify/Product/1\"}\n");
        for n in 0..3 {
            export.push_str(&format!(
                "{{\"id\":\"gid://shopify/ProductVariant/{n}\",\"__parentId\":\"gid://shopify/Product/1\"}}\n"
            ));
        }
        let mut stream = RecordStream::new(chunked(export.into_bytes(), 16), 0, 2);
        assert!(matches!(
            stream.next().await,
            Some(Err(ImportError::MalformedExport { message, .. })) if message.contains("exceeds 2")
        ));
    }

    #[tokio::test]
    async fn tolerates_blank_lines_crlf_and_missing_final_newline() {
        let export = concat!(
            "\r\n",
            r#"{"id":"gid://shopify/Product/1","title":"A"}"#,
            "\r\n\r\n",
            r#"{"id":"gid://shopify/ProductImage/5","__parentId":"gid://shopify/Product/1","src":"https://cdn/x.png"}"#,
        );
        let out: Vec<_> = collect(chunked(export.as_bytes().to_vec(), 9), 10)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record.images[0].src.as_deref(), Some("https://cdn/x.png"));
        assert_eq!(out[0].start_offset, 12);
        assert_eq!(out[0].end_offset, 10 + export.len() as u64);
    }

    #[test]
    fn weight_units_map_to_erp_names() {
        assert_eq!(weight_uom("GRAMS"), Some("Gram"));
        assert_eq!(weight_uom("kg"), Some("Kg"));
        assert_eq!(weight_uom("POUNDS"), Some("Pound"));
        assert_eq!(weight_uom("OUNCES"), Some("Ounce"));
        assert_eq!(weight_uom("STONE"), None);
    }

    #[tokio::test]
    async fn variant_weight_is_read_from_the_inventory_item() {
        let export = concat!(
            r#"{"id":"gid://shopify/Product/1","title":"Kettle"}"#,
            "\n",
            r#"{"id":"gid://shopify/ProductVariant/11","sku":"K-1","inventoryItem":{"measurement":{"weight":{"unit":"GRAMS","value":850.0}}},"__parentId":"gid://shopify/Product/1"}"#,
            "\n",
            r#"{"id":"gid://shopify/ProductVariant/12","sku":"K-2","inventoryItem":{"measurement":{"weight":null}},"__parentId":"gid://shopify/Product/1"}"#,
            "\n",
            r#"{"id":"gid://shopify/ProductVariant/13","sku":"K-3","weight":2.0,"weightUnit":"POUNDS","__parentId":"gid://shopify/Product/1"}"#,
            "\n",
        );
        let out = collect(chunked(export.as_bytes().to_vec(), 32), 0).await;
        assert_eq!(out.len(), 1);
        let variants = &out[0].as_ref().unwrap().record.variants;
        assert_eq!(variants[0].weight, Some(850.0));
        assert_eq!(variants[0].weight_uom.as_deref(), Some("Gram"));
        assert_eq!(variants[1].weight, None);
        assert_eq!(variants[1].weight_uom, None);
        assert_eq!(variants[2].weight, Some(2.0));
        assert_eq!(variants[2].weight_uom.as_deref(), Some("Pound"));
    }
}
