//! Value extraction and record flattening: turns one hierarchical
//! submission into flat rows for the store, including WKT conversion and
//! geometry fan-out for map fields inside repeatable sections.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value as JsonValue};
use tracing::warn;

use formgrid_core::{
    derived_column_id, format_datetime_value, normalize_column_id, parse_bool_value,
    truncate_json_text, truncate_text, Applicant, ColumnCatalog, FieldInstance, FieldKind,
    FlatRow, GeoArea, GeoIdentity, Geometry, ReviewerGroup, RowIdentity, Submission,
    BANK_DETAIL_SUFFIXES, NO_GEOMETRY_SENTINEL, TABLE_ANNOTATIONS, TABLE_APPLICANTS,
    TABLE_FIELDS, TABLE_REVIEWERS, TABLE_SUBMISSIONS,
};

pub const CRATE_NAME: &str = "formgrid-extract";

/// Everything one field instance contributes to its row. `extra` holds
/// derived same-row columns keyed by their full column id; `geo_areas` is
/// non-empty only for map fields and drives row fan-out.
#[derive(Debug, Default)]
pub struct Extraction {
    pub primary: JsonValue,
    pub extra: Vec<(String, JsonValue)>,
    pub geo_areas: Vec<GeoArea>,
}

fn text(value: &str) -> JsonValue {
    JsonValue::String(truncate_text(value))
}

fn json_shadow(resolved_id: &str, payload: &impl serde::Serialize, max_len: usize) -> (String, JsonValue) {
    let rendered = serde_json::to_string(payload).unwrap_or_default();
    (
        derived_column_id(resolved_id, "json", max_len),
        JsonValue::String(truncate_json_text(&rendered)),
    )
}

/// Summary line for one drawn shape, 1-based.
pub fn geo_area_summary(index: usize, area: &GeoArea) -> String {
    format!(
        "Zone {index}: {} - {}",
        area.source.as_deref().unwrap_or("inconnue"),
        area.description.as_deref().unwrap_or("")
    )
}

fn area_display(name: Option<&str>, code: Option<&str>) -> JsonValue {
    match (name, code) {
        (Some(name), Some(code)) => JsonValue::String(format!("{name} ({code})")),
        (Some(name), None) => JsonValue::String(name.to_string()),
        (None, Some(code)) => JsonValue::String(code.to_string()),
        (None, None) => JsonValue::String(String::new()),
    }
}

fn bank_detail_extras(instance: &FieldInstance, resolved_id: &str, max_len: usize) -> Vec<(String, JsonValue)> {
    let mut extras = Vec::new();
    for file in &instance.files {
        for sub in &file.columns {
            if sub.kind.as_deref() == Some("piece_justificative") {
                continue;
            }
            let value = match sub.value.as_deref() {
                Some(value) if !value.is_empty() => value,
                _ => continue,
            };
            let lower = sub.label.to_lowercase();
            let suffix = if lower.contains("titulaire") {
                "titulaire"
            } else if lower.contains("iban") {
                "iban"
            } else if lower.contains("bic") {
                "bic"
            } else if lower.contains("banque") {
                "nom_de_la_banque"
            } else {
                continue;
            };
            debug_assert!(BANK_DETAIL_SUFFIXES.contains(&suffix));
            extras.push((derived_column_id(resolved_id, suffix, max_len), text(value)));
        }
    }
    extras
}

/// Per-kind extraction of one field instance. `resolved_id` is the column
/// id the flattener allocated for this instance's label.
pub fn extract_value(instance: &FieldInstance, resolved_id: &str, max_len: usize) -> Extraction {
    let mut out = Extraction::default();
    match instance.kind {
        FieldKind::HeaderSection | FieldKind::Explication | FieldKind::Repetition => {}
        FieldKind::IntegerNumber => {
            out.primary = instance
                .integer_value
                .or_else(|| instance.string_value.as_deref().and_then(|s| s.trim().parse().ok()))
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null);
        }
        FieldKind::Number | FieldKind::DecimalNumber => {
            out.primary = instance
                .decimal_value
                .or_else(|| instance.string_value.as_deref().and_then(|s| s.trim().parse().ok()))
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null);
        }
        FieldKind::Checkbox | FieldKind::YesNo => {
            out.primary = instance
                .checked
                .or_else(|| instance.string_value.as_deref().and_then(parse_bool_value))
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null);
        }
        FieldKind::Date | FieldKind::Datetime => {
            let raw = instance
                .date_value
                .as_deref()
                .or(instance.string_value.as_deref());
            out.primary = match raw {
                Some(raw) => match format_datetime_value(raw) {
                    Some(formatted) => JsonValue::String(formatted),
                    None => text(raw),
                },
                None => JsonValue::Null,
            };
        }
        FieldKind::MultipleDropDownList => {
            out.primary = text(&instance.values.join(", "));
            out.extra.push(json_shadow(resolved_id, &instance.values, max_len));
        }
        FieldKind::LinkedDropDownList => {
            let rendered = match instance.string_value.as_deref() {
                Some(value) => value.to_string(),
                None => instance.values.join(", "),
            };
            out.primary = text(&rendered);
            out.extra.push(json_shadow(resolved_id, &instance.values, max_len));
        }
        FieldKind::PieceJustificative => {
            let names: Vec<&str> = instance.files.iter().map(|f| f.filename.as_str()).collect();
            out.primary = text(&names.join(", "));
            out.extra.extend(bank_detail_extras(instance, resolved_id, max_len));
        }
        FieldKind::Address => {
            let display = instance
                .address
                .as_ref()
                .and_then(|a| a.label.clone().or_else(|| a.street.clone()))
                .or_else(|| instance.string_value.clone())
                .unwrap_or_default();
            out.primary = text(&display);
            if let Some(address) = &instance.address {
                out.extra.push(json_shadow(resolved_id, address, max_len));
            }
        }
        FieldKind::Communes => {
            let area = instance.area.clone().unwrap_or_default();
            out.primary = area_display(area.name.as_deref(), area.code.as_deref());
            out.extra.push((
                derived_column_id(resolved_id, "postal_code", max_len),
                text(area.postal_code.as_deref().unwrap_or("")),
            ));
            out.extra.push((
                derived_column_id(resolved_id, "department", max_len),
                text(area.department.as_deref().unwrap_or("")),
            ));
            out.extra.push((
                derived_column_id(resolved_id, "insee_code", max_len),
                text(area.insee_code.as_deref().unwrap_or("")),
            ));
        }
        FieldKind::Departements | FieldKind::Regions | FieldKind::Pays | FieldKind::Epci => {
            let area = instance.area.clone().unwrap_or_default();
            out.primary = area_display(area.name.as_deref(), area.code.as_deref());
            out.extra.push((
                derived_column_id(resolved_id, "name", max_len),
                text(area.name.as_deref().unwrap_or("")),
            ));
            out.extra.push((
                derived_column_id(resolved_id, "code", max_len),
                text(area.code.as_deref().unwrap_or("")),
            ));
        }
        FieldKind::Siret => {
            let display = match &instance.company {
                Some(company) => format!(
                    "{} - {}",
                    company.siret,
                    company.legal_name.as_deref().unwrap_or("")
                ),
                None => instance.string_value.clone().unwrap_or_default(),
            };
            out.primary = text(&display);
            if let Some(company) = &instance.company {
                out.extra.push(json_shadow(resolved_id, company, max_len));
            }
        }
        FieldKind::DossierLink => {
            let display = match &instance.linked_submission {
                Some(linked) => match (linked.number, linked.state.as_deref()) {
                    (Some(number), Some(state)) => format!("Dossier #{number} ({state})"),
                    (Some(number), None) => format!("Dossier #{number}"),
                    _ => String::new(),
                },
                None => instance.string_value.clone().unwrap_or_default(),
            };
            out.primary = text(&display);
            if let Some(linked) = &instance.linked_submission {
                out.extra.push(json_shadow(resolved_id, linked, max_len));
            }
        }
        FieldKind::EngagementJuridique => {
            let mut parts = Vec::new();
            if let Some(commitment) = &instance.commitment {
                if let Some(amount) = commitment.committed_amount {
                    parts.push(format!("Montant engagé: {amount}"));
                }
                if let Some(amount) = commitment.paid_amount {
                    parts.push(format!("Montant payé: {amount}"));
                }
            }
            out.primary = text(&parts.join(", "));
            if let Some(commitment) = &instance.commitment {
                out.extra.push(json_shadow(resolved_id, commitment, max_len));
            }
        }
        FieldKind::Carte => {
            if instance.geo_areas.is_empty() {
                out.primary = JsonValue::String(NO_GEOMETRY_SENTINEL.to_string());
            } else {
                let summaries: Vec<String> = instance
                    .geo_areas
                    .iter()
                    .enumerate()
                    .map(|(i, area)| geo_area_summary(i + 1, area))
                    .collect();
                out.primary = text(&summaries.join("; "));
                out.geo_areas = instance.geo_areas.clone();
            }
        }
        _ => {
            out.primary = match instance.string_value.as_deref() {
                Some(value) => text(value),
                None => JsonValue::String(String::new()),
            };
        }
    }
    out
}

// ---------------------------------------------------------------------------
// WKT conversion
// ---------------------------------------------------------------------------

fn wkt_coord(value: &JsonValue) -> Option<String> {
    let pair = value.as_array()?;
    let x = pair.first()?.as_f64()?;
    let y = pair.get(1)?.as_f64()?;
    Some(format!("{x} {y}"))
}

fn wkt_coord_list(value: &JsonValue) -> Option<String> {
    let points = value.as_array()?;
    if points.is_empty() {
        return None;
    }
    let rendered: Option<Vec<String>> = points.iter().map(wkt_coord).collect();
    Some(rendered?.join(", "))
}

/// Rings must close; the source occasionally emits open ones.
fn wkt_ring(value: &JsonValue) -> Option<String> {
    let points = value.as_array()?;
    if points.is_empty() {
        return None;
    }
    let mut rendered: Vec<String> = points.iter().map(wkt_coord).collect::<Option<_>>()?;
    if points.first() != points.last() {
        rendered.push(wkt_coord(points.first()?)?);
    }
    Some(format!("({})", rendered.join(", ")))
}

fn wkt_polygon_body(value: &JsonValue) -> Option<String> {
    let rings = value.as_array()?;
    if rings.is_empty() {
        return None;
    }
    let rendered: Option<Vec<String>> = rings.iter().map(wkt_ring).collect();
    Some(format!("({})", rendered?.join(", ")))
}

/// GeoJSON geometry to WKT. Returns `None` for malformed coordinates and
/// for geometry collections, which the store has no column shape for.
pub fn wkt_from_geometry(geometry: &Geometry) -> Option<String> {
    match geometry.kind.as_str() {
        "Point" => Some(format!("POINT({})", wkt_coord(&geometry.coordinates)?)),
        "LineString" => Some(format!(
            "LINESTRING({})",
            wkt_coord_list(&geometry.coordinates)?
        )),
        "Polygon" => Some(format!(
            "POLYGON{}",
            wkt_polygon_body(&geometry.coordinates)?
        )),
        "MultiPoint" => Some(format!(
            "MULTIPOINT({})",
            wkt_coord_list(&geometry.coordinates)?
        )),
        "MultiLineString" => {
            let lines = geometry.coordinates.as_array()?;
            let rendered: Option<Vec<String>> = lines
                .iter()
                .map(|line| Some(format!("({})", wkt_coord_list(line)?)))
                .collect();
            Some(format!("MULTILINESTRING({})", rendered?.join(", ")))
        }
        "MultiPolygon" => {
            let polygons = geometry.coordinates.as_array()?;
            let rendered: Option<Vec<String>> =
                polygons.iter().map(wkt_polygon_body).collect();
            Some(format!("MULTIPOLYGON({})", rendered?.join(", ")))
        }
        "GeometryCollection" => {
            warn!("geometry collections are not representable, skipping WKT");
            None
        }
        other => {
            warn!(kind = other, "unknown geometry kind, skipping WKT");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Record flattening
// ---------------------------------------------------------------------------

/// Per-namespace duplicate-label counter. Suffixes repeat occurrences of
/// the same normalized label with `_1`, `_2`, … so they land in the columns
/// the catalog allocated for them.
#[derive(Default)]
struct LabelDeduper {
    counts: HashMap<String, usize>,
}

impl LabelDeduper {
    fn resolve(&mut self, label: &str, max_len: usize) -> String {
        let base = normalize_column_id(label, max_len);
        let seen = self.counts.entry(base.clone()).or_insert(0);
        let resolved = if *seen == 0 {
            base.clone()
        } else {
            normalize_column_id(&format!("{label}_{seen}"), max_len)
        };
        *seen += 1;
        resolved
    }
}

fn instance_schema_id(instance: &FieldInstance) -> &str {
    instance.descriptor_id.as_deref().unwrap_or(&instance.id)
}

fn set_extraction(row: &mut FlatRow, resolved_id: &str, extraction: &Extraction) {
    row.set(resolved_id, extraction.primary.clone());
    for (column, value) in &extraction.extra {
        row.set(column.clone(), value.clone());
    }
}

fn format_utc(value: &Option<chrono::DateTime<chrono::Utc>>) -> JsonValue {
    match value {
        Some(dt) => JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        None => JsonValue::Null,
    }
}

fn header_row(submission: &Submission) -> FlatRow {
    let mut row = FlatRow::new(
        TABLE_SUBMISSIONS,
        RowIdentity::Record {
            submission_number: submission.number,
        },
    );
    row.set("submission_number", json!(submission.number));
    row.set("state", json!(submission.state));
    row.set("archived", json!(submission.archived));
    row.set(
        "applicant_email",
        json!(submission.applicant_email.as_deref().unwrap_or("")),
    );
    row.set("submitted_at", format_utc(&submission.submitted_at));
    row.set("updated_at", format_utc(&submission.updated_at));
    row.set("processed_at", format_utc(&submission.processed_at));
    row.set(
        "motivation",
        json!(submission.motivation.as_deref().unwrap_or("")),
    );
    if submission.labels.is_empty() {
        row.set("label_names", json!(""));
        row.set("labels_json", json!(""));
    } else {
        let names: Vec<&str> = submission.labels.iter().map(|l| l.name.as_str()).collect();
        row.set("label_names", json!(names.join(", ")));
        let rendered = serde_json::to_string(&submission.labels).unwrap_or_default();
        row.set("labels_json", json!(truncate_json_text(&rendered)));
    }
    row
}

fn applicant_row(submission: &Submission) -> Option<FlatRow> {
    let applicant = submission.applicant.as_ref()?;
    let mut row = FlatRow::new(
        TABLE_APPLICANTS,
        RowIdentity::Record {
            submission_number: submission.number,
        },
    );
    row.set("submission_number", json!(submission.number));
    match applicant {
        Applicant::Individual {
            civility,
            first_name,
            last_name,
            email,
        } => {
            row.set("applicant_type", json!("individual"));
            row.set("civility", json!(civility.as_deref().unwrap_or("")));
            row.set("first_name", json!(first_name.as_deref().unwrap_or("")));
            row.set("last_name", json!(last_name.as_deref().unwrap_or("")));
            row.set("email", json!(email.as_deref().unwrap_or("")));
        }
        Applicant::Organization { company, email } => {
            row.set("applicant_type", json!("organization"));
            row.set("email", json!(email.as_deref().unwrap_or("")));
            row.set("siret", json!(company.siret));
            row.set(
                "legal_name",
                json!(company.legal_name.as_deref().unwrap_or("")),
            );
            row.set(
                "legal_form",
                json!(company.legal_form.as_deref().unwrap_or("")),
            );
            row.set(
                "registration_date",
                json!(company.registration_date.as_deref().unwrap_or("")),
            );
            row.set(
                "administrative_status",
                json!(company.administrative_status.as_deref().unwrap_or("")),
            );
            if let Some(address) = &company.address {
                row.set("address_street", json!(address.street.as_deref().unwrap_or("")));
                row.set(
                    "address_postal_code",
                    json!(address.postal_code.as_deref().unwrap_or("")),
                );
                row.set("address_city", json!(address.city.as_deref().unwrap_or("")));
            }
        }
    }
    Some(row)
}

/// Flat-field row over one instance namespace (fields or annotations).
fn wide_row(
    table: &str,
    submission_number: i64,
    instances: &[FieldInstance],
    problematic: &HashSet<String>,
    strip_annotation_prefix: bool,
    max_len: usize,
) -> FlatRow {
    let mut row = FlatRow::new(table, RowIdentity::Record { submission_number });
    row.set("submission_number", json!(submission_number));
    let mut deduper = LabelDeduper::default();
    for instance in instances {
        if problematic.contains(instance_schema_id(instance))
            || instance.kind.is_display_only()
            || instance.kind == FieldKind::Repetition
        {
            continue;
        }
        let label = if strip_annotation_prefix {
            instance.label.strip_prefix("annotation_").unwrap_or(&instance.label)
        } else {
            &instance.label
        };
        let resolved = deduper.resolve(label, max_len);
        let extraction = extract_value(instance, &resolved, max_len);
        set_extraction(&mut row, &resolved, &extraction);
    }
    row
}

fn geo_fields(area: &GeoArea) -> Vec<(&'static str, JsonValue)> {
    let (kind, wkt, coordinates) = match &area.geometry {
        Some(geometry) => (
            JsonValue::String(geometry.kind.clone()),
            wkt_from_geometry(geometry)
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
            JsonValue::String(truncate_json_text(
                &serde_json::to_string(&geometry.coordinates).unwrap_or_default(),
            )),
        ),
        None => (JsonValue::Null, JsonValue::Null, JsonValue::Null),
    };
    vec![
        ("geo_id", json!(area.id)),
        ("geo_source", json!(area.source.as_deref().unwrap_or(""))),
        (
            "geo_description",
            json!(area.description.as_deref().unwrap_or("")),
        ),
        ("geo_type", kind),
        ("geo_coordinates", coordinates),
        ("geo_wkt", wkt),
        ("geo_commune", json!(area.commune.as_deref().unwrap_or(""))),
        (
            "geo_parcel_number",
            json!(area.parcel_number.as_deref().unwrap_or("")),
        ),
        ("geo_section", json!(area.section.as_deref().unwrap_or(""))),
        ("geo_prefix", json!(area.prefix.as_deref().unwrap_or(""))),
        (
            "geo_surface",
            area.surface.map(JsonValue::from).unwrap_or(JsonValue::Null),
        ),
    ]
}

/// Rows for one repeatable-section instance. A map field with N shapes
/// fans the iteration out into N rows, one per shape, with `_geo{i}`
/// appended to the row id.
fn section_rows(
    section: &str,
    submission_number: i64,
    instance: &FieldInstance,
    problematic: &HashSet<String>,
    max_len: usize,
) -> Vec<FlatRow> {
    let mut rows = Vec::new();
    for (index, iteration) in instance.rows.iter().enumerate() {
        let row_index = (index + 1) as i64;
        let mut base = FlatRow::new(
            section,
            RowIdentity::SectionRow {
                submission_number,
                section: section.to_string(),
                row_index,
                row_id: iteration.id.clone(),
                geo: None,
            },
        );
        base.set("record_key", json!(submission_number));
        base.set("row_index", json!(row_index));
        base.set("row_id", json!(iteration.id));

        let mut deduper = LabelDeduper::default();
        let mut fan_out: Option<(String, Vec<GeoArea>)> = None;
        for inner in &iteration.fields {
            if problematic.contains(instance_schema_id(inner)) || inner.kind.is_display_only() {
                continue;
            }
            let resolved = deduper.resolve(&inner.label, max_len);
            let extraction = extract_value(inner, &resolved, max_len);
            set_extraction(&mut base, &resolved, &extraction);
            if inner.kind == FieldKind::Carte && !extraction.geo_areas.is_empty() {
                fan_out = Some((resolved, extraction.geo_areas));
            }
        }

        match fan_out {
            None => rows.push(base),
            Some((carte_column, areas)) => {
                for (i, area) in areas.iter().enumerate() {
                    let shape_index = i + 1;
                    let row_id = format!("{}_geo{shape_index}", iteration.id);
                    let mut row = base.clone();
                    row.identity = RowIdentity::SectionRow {
                        submission_number,
                        section: section.to_string(),
                        row_index,
                        row_id: row_id.clone(),
                        geo: Some(GeoIdentity {
                            field: carte_column.clone(),
                            geo_id: area.id.clone(),
                        }),
                    };
                    row.set("row_id", json!(row_id));
                    row.set(carte_column.clone(), json!(geo_area_summary(shape_index, area)));
                    for (column, value) in geo_fields(area) {
                        row.set(column, value);
                    }
                    rows.push(row);
                }
            }
        }
    }
    rows
}

/// Flattens one submission into rows for every logical table. Tables the
/// catalog does not know are skipped with a warning rather than invented
/// on the fly.
pub fn flatten_submission(
    submission: &Submission,
    catalog: &ColumnCatalog,
    problematic: &HashSet<String>,
    max_len: usize,
) -> Vec<FlatRow> {
    let mut rows = vec![header_row(submission)];

    rows.push(wide_row(
        TABLE_FIELDS,
        submission.number,
        &submission.fields,
        problematic,
        false,
        max_len,
    ));
    rows.push(wide_row(
        TABLE_ANNOTATIONS,
        submission.number,
        &submission.annotations,
        problematic,
        true,
        max_len,
    ));

    let mut section_deduper = LabelDeduper::default();
    for instance in &submission.fields {
        if instance.kind != FieldKind::Repetition
            || problematic.contains(instance_schema_id(instance))
        {
            continue;
        }
        let section = section_deduper.resolve(&instance.label, max_len);
        if catalog.columns(&section).is_none() {
            warn!(section = %section, "no table for repeatable section, skipping");
            continue;
        }
        rows.extend(section_rows(
            &section,
            submission.number,
            instance,
            problematic,
            max_len,
        ));
    }

    if let Some(row) = applicant_row(submission) {
        rows.push(row);
    }

    rows
}

/// Reviewer roster rows, one per reviewer per group.
pub fn reviewer_rows(groups: &[ReviewerGroup]) -> Vec<FlatRow> {
    let mut rows = Vec::new();
    for group in groups {
        for reviewer in &group.reviewers {
            let mut row = FlatRow::new(
                TABLE_REVIEWERS,
                RowIdentity::Reviewer {
                    reviewer_id: reviewer.id.clone(),
                },
            );
            row.set("group_label", json!(group.label));
            row.set("reviewer_id", json!(reviewer.id));
            row.set("reviewer_email", json!(reviewer.email));
            rows.push(row);
        }
    }
    rows
}
