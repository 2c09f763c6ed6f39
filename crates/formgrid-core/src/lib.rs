//! Domain model for form submissions and the column catalog derived from
//! their descriptor forest: field kinds, descriptor classification,
//! column-id normalization and per-table catalog building.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "formgrid-core";

/// Store-side length limits for cell values.
pub const TEXT_VALUE_LIMIT: usize = 1000;
pub const JSON_VALUE_LIMIT: usize = 10_000;

/// Column identifiers longer than this are truncated and content-hashed.
pub const MAX_COLUMN_ID_LEN: usize = 50;

/// Written in place of geometry fields when a map field carries no shape.
pub const NO_GEOMETRY_SENTINEL: &str = "Aucune zone géographique définie";

pub const TABLE_SUBMISSIONS: &str = "submissions";
pub const TABLE_FIELDS: &str = "fields";
pub const TABLE_ANNOTATIONS: &str = "annotations";
pub const TABLE_APPLICANTS: &str = "applicants";
pub const TABLE_REVIEWERS: &str = "reviewers";

/// Every field kind the source platform can declare. Unknown wire tags
/// deserialize to `Unknown` and fall back to text handling; they are never
/// dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Textarea,
    Email,
    Phone,
    Number,
    IntegerNumber,
    DecimalNumber,
    Date,
    Datetime,
    Checkbox,
    YesNo,
    #[serde(rename = "civilite")]
    Civility,
    DropDownList,
    MultipleDropDownList,
    LinkedDropDownList,
    PieceJustificative,
    Address,
    Communes,
    Departements,
    Regions,
    Pays,
    Epci,
    Siret,
    Rna,
    Iban,
    Carte,
    DossierLink,
    EngagementJuridique,
    Repetition,
    HeaderSection,
    Explication,
    #[serde(other)]
    Unknown,
}

impl FieldKind {
    /// Display-only kinds never produce a column or a value.
    pub fn is_display_only(self) -> bool {
        matches!(self, FieldKind::HeaderSection | FieldKind::Explication)
    }

    pub fn column_type(self) -> ColumnType {
        match self {
            FieldKind::IntegerNumber => ColumnType::Int,
            FieldKind::Number | FieldKind::DecimalNumber => ColumnType::Numeric,
            FieldKind::Checkbox | FieldKind::YesNo => ColumnType::Bool,
            FieldKind::Date => ColumnType::Date,
            FieldKind::Datetime => ColumnType::DateTime,
            _ => ColumnType::Text,
        }
    }
}

impl Default for FieldKind {
    fn default() -> Self {
        FieldKind::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Int,
    Numeric,
    Bool,
    Date,
    DateTime,
}

impl ColumnType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Text" => Some(ColumnType::Text),
            "Int" => Some(ColumnType::Int),
            "Numeric" => Some(ColumnType::Numeric),
            "Bool" => Some(ColumnType::Bool),
            "Date" => Some(ColumnType::Date),
            "DateTime" => Some(ColumnType::DateTime),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Text => "Text",
            ColumnType::Int => "Int",
            ColumnType::Numeric => "Numeric",
            ColumnType::Bool => "Bool",
            ColumnType::Date => "Date",
            ColumnType::DateTime => "DateTime",
        }
    }
}

/// One typed column of a logical table. Ids are normalized and unique
/// within their table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(id: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            id: id.into(),
            column_type,
        }
    }
}

/// Schema-level definition of one field or annotation. `sub_descriptors`
/// is populated only for repeatable sections; the platform disallows
/// nesting a section inside a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub id: String,
    pub kind: FieldKind,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sub_descriptors: Vec<FieldDescriptor>,
}

/// The two descriptor namespaces of one form revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorForest {
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub annotations: Vec<FieldDescriptor>,
}

// ---------------------------------------------------------------------------
// Column-id normalization
// ---------------------------------------------------------------------------

/// Normalize a human label into a store column id: ASCII, lowercase,
/// underscore-separated, starting with a letter, at most `max_len` bytes
/// (overflow replaced by truncation plus a 6-hex content hash). Idempotent.
pub fn normalize_column_id(label: &str, max_len: usize) -> String {
    let trimmed = strip_leading_numbering(label.trim());

    let mut decomposed = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        if c == '\'' || c == '’' {
            decomposed.push('_');
            continue;
        }
        for d in c.nfkd() {
            if !unicode_normalization::char::is_combining_mark(d) {
                decomposed.push(d);
            }
        }
    }

    let mut out = String::with_capacity(decomposed.len());
    let mut prev_underscore = false;
    for c in decomposed.chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_alphanumeric() { c } else { '_' };
        if mapped == '_' {
            if prev_underscore {
                continue;
            }
            prev_underscore = true;
        } else {
            prev_underscore = false;
        }
        out.push(mapped);
    }

    let out = out.trim_matches('_');
    let out = if out.is_empty() {
        "col".to_string()
    } else if !out.as_bytes()[0].is_ascii_alphabetic() {
        format!("col_{out}")
    } else {
        out.to_string()
    };

    clamp_column_id_len(out, max_len)
}

/// Labels like `1. Nom` or `2 - Adresse` carry form-builder numbering that
/// must not leak into column ids. Digits with no separator (`2ème avis`)
/// are kept.
fn strip_leading_numbering(label: &str) -> &str {
    let bytes = label.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == 0 {
        return label;
    }
    let mut j = i;
    while j < bytes.len() && matches!(bytes[j], b'.' | b'-' | b')' | b':' | b' ') {
        j += 1;
    }
    if j > i {
        &label[j..]
    } else {
        label
    }
}

/// Id of a derived column (`commune_postal_code`, `adresse_json`), clamped
/// the same way as plain ids so catalog and extractor always agree.
pub fn derived_column_id(resolved: &str, suffix: &str, max_len: usize) -> String {
    clamp_column_id_len(format!("{resolved}_{suffix}"), max_len)
}

fn clamp_column_id_len(id: String, max_len: usize) -> String {
    if id.len() <= max_len {
        return id;
    }
    let digest = Sha256::digest(id.as_bytes());
    let hash = hex::encode(&digest[..3]);
    let keep = max_len.saturating_sub(hash.len() + 1);
    let mut head: String = id.chars().take(keep).collect();
    while head.ends_with('_') {
        head.pop();
    }
    // a length limit smaller than the hash would otherwise leave no head
    if head.is_empty() {
        head.push_str("col");
    }
    format!("{head}_{hash}")
}

// ---------------------------------------------------------------------------
// Descriptor classifier
// ---------------------------------------------------------------------------

pub const BANK_DETAIL_SUFFIXES: [&str; 4] = ["titulaire", "iban", "bic", "nom_de_la_banque"];
pub const COMMUNE_SUFFIXES: [&str; 3] = ["postal_code", "department", "insee_code"];
pub const AREA_SUFFIXES: [&str; 2] = ["name", "code"];

pub const GEO_COLUMNS: [(&str, ColumnType); 11] = [
    ("geo_id", ColumnType::Text),
    ("geo_source", ColumnType::Text),
    ("geo_description", ColumnType::Text),
    ("geo_type", ColumnType::Text),
    ("geo_coordinates", ColumnType::Text),
    ("geo_wkt", ColumnType::Text),
    ("geo_commune", ColumnType::Text),
    ("geo_parcel_number", ColumnType::Text),
    ("geo_section", ColumnType::Text),
    ("geo_prefix", ColumnType::Text),
    ("geo_surface", ColumnType::Numeric),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedColumn {
    pub suffix: &'static str,
    pub column_type: ColumnType,
}

/// What one descriptor contributes to its table.
#[derive(Debug, Clone)]
pub struct Classification {
    pub drop: bool,
    pub column_type: ColumnType,
    pub derived: Vec<DerivedColumn>,
    pub json_shadow: bool,
}

pub fn is_bank_detail_label(label: &str) -> bool {
    let lower = label.to_lowercase();
    lower.contains("rib") || lower.contains("iban")
}

pub fn classify(descriptor: &FieldDescriptor) -> Classification {
    let kind = descriptor.kind;
    if kind.is_display_only() {
        return Classification {
            drop: true,
            column_type: ColumnType::Text,
            derived: Vec::new(),
            json_shadow: false,
        };
    }

    let derived: Vec<DerivedColumn> = match kind {
        FieldKind::PieceJustificative if is_bank_detail_label(&descriptor.label) => {
            BANK_DETAIL_SUFFIXES
                .iter()
                .map(|suffix| DerivedColumn {
                    suffix,
                    column_type: ColumnType::Text,
                })
                .collect()
        }
        FieldKind::Communes => COMMUNE_SUFFIXES
            .iter()
            .map(|suffix| DerivedColumn {
                suffix,
                column_type: ColumnType::Text,
            })
            .collect(),
        FieldKind::Departements | FieldKind::Regions | FieldKind::Pays | FieldKind::Epci => {
            AREA_SUFFIXES
                .iter()
                .map(|suffix| DerivedColumn {
                    suffix,
                    column_type: ColumnType::Text,
                })
                .collect()
        }
        _ => Vec::new(),
    };

    let json_shadow = matches!(
        kind,
        FieldKind::Address
            | FieldKind::Siret
            | FieldKind::DossierLink
            | FieldKind::MultipleDropDownList
            | FieldKind::LinkedDropDownList
            | FieldKind::EngagementJuridique
    );

    Classification {
        drop: false,
        column_type: kind.column_type(),
        derived,
        json_shadow,
    }
}

/// Ids of display-only descriptors, recursing into repeatable sections.
/// Catalog building, flattening and section-row extraction all filter
/// against this one set.
pub fn collect_problematic_ids(forest: &DescriptorForest) -> HashSet<String> {
    let mut ids = HashSet::new();
    collect_display_only(&forest.fields, &mut ids);
    collect_display_only(&forest.annotations, &mut ids);
    ids
}

fn collect_display_only(descriptors: &[FieldDescriptor], ids: &mut HashSet<String>) {
    for descriptor in descriptors {
        if descriptor.kind.is_display_only() {
            ids.insert(descriptor.id.clone());
        }
        if descriptor.kind == FieldKind::Repetition {
            collect_display_only(&descriptor.sub_descriptors, ids);
        }
    }
}

// ---------------------------------------------------------------------------
// Column catalog
// ---------------------------------------------------------------------------

/// Per-table column definitions derived from one descriptor forest.
/// Rebuilt on every sync run; never persisted.
#[derive(Debug, Clone, Default)]
pub struct ColumnCatalog {
    pub tables: BTreeMap<String, Vec<ColumnSpec>>,
    /// Normalized section labels, in descriptor traversal order.
    pub section_tables: Vec<String>,
    pub has_repeatable_sections: bool,
    pub has_geometry_fields: bool,
}

impl ColumnCatalog {
    pub fn columns(&self, table: &str) -> Option<&[ColumnSpec]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn has_column(&self, table: &str, id: &str) -> bool {
        self.columns(table)
            .is_some_and(|cols| cols.iter().any(|c| c.id == id))
    }
}

#[derive(Default)]
struct IdAllocator {
    used: HashSet<String>,
}

impl IdAllocator {
    fn reserve(&mut self, id: &str) -> bool {
        self.used.insert(id.to_string())
    }

    fn allocate(&mut self, base: &str, max_len: usize) -> String {
        if self.used.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 1usize;
        loop {
            let candidate = clamp_column_id_len(format!("{base}_{n}"), max_len);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn submission_header_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("submission_number", ColumnType::Int),
        ColumnSpec::new("state", ColumnType::Text),
        ColumnSpec::new("archived", ColumnType::Bool),
        ColumnSpec::new("applicant_email", ColumnType::Text),
        ColumnSpec::new("submitted_at", ColumnType::DateTime),
        ColumnSpec::new("updated_at", ColumnType::DateTime),
        ColumnSpec::new("processed_at", ColumnType::DateTime),
        ColumnSpec::new("motivation", ColumnType::Text),
        ColumnSpec::new("label_names", ColumnType::Text),
        ColumnSpec::new("labels_json", ColumnType::Text),
    ]
}

fn section_identity_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("record_key", ColumnType::Int),
        ColumnSpec::new("row_index", ColumnType::Int),
        ColumnSpec::new("row_id", ColumnType::Text),
    ]
}

fn applicant_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("submission_number", ColumnType::Int),
        ColumnSpec::new("applicant_type", ColumnType::Text),
        ColumnSpec::new("civility", ColumnType::Text),
        ColumnSpec::new("first_name", ColumnType::Text),
        ColumnSpec::new("last_name", ColumnType::Text),
        ColumnSpec::new("email", ColumnType::Text),
        ColumnSpec::new("siret", ColumnType::Text),
        ColumnSpec::new("legal_name", ColumnType::Text),
        ColumnSpec::new("legal_form", ColumnType::Text),
        ColumnSpec::new("registration_date", ColumnType::Date),
        ColumnSpec::new("administrative_status", ColumnType::Text),
        ColumnSpec::new("address_street", ColumnType::Text),
        ColumnSpec::new("address_postal_code", ColumnType::Text),
        ColumnSpec::new("address_city", ColumnType::Text),
    ]
}

fn reviewer_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("group_label", ColumnType::Text),
        ColumnSpec::new("reviewer_id", ColumnType::Text),
        ColumnSpec::new("reviewer_email", ColumnType::Text),
    ]
}

fn push_labeled_columns(
    columns: &mut Vec<ColumnSpec>,
    alloc: &mut IdAllocator,
    label: &str,
    descriptor: &FieldDescriptor,
    max_len: usize,
) -> String {
    let classification = classify(descriptor);
    let base = normalize_column_id(label, max_len);
    let resolved = alloc.allocate(&base, max_len);
    columns.push(ColumnSpec::new(resolved.clone(), classification.column_type));

    for derived in &classification.derived {
        let id = derived_column_id(&resolved, derived.suffix, max_len);
        if alloc.reserve(&id) {
            columns.push(ColumnSpec::new(id, derived.column_type));
        }
    }
    if classification.json_shadow {
        let id = derived_column_id(&resolved, "json", max_len);
        if alloc.reserve(&id) {
            columns.push(ColumnSpec::new(id, ColumnType::Text));
        }
    }
    resolved
}

pub fn build_catalog(forest: &DescriptorForest) -> (ColumnCatalog, HashSet<String>) {
    build_catalog_with_limit(forest, MAX_COLUMN_ID_LEN)
}

/// Depth-first walk of field then annotation descriptors. Each repeatable
/// section opens its own table keyed by the section's normalized label;
/// geometry columns are appended only to section tables that contain a map
/// field. Collisions within one table get `_1`, `_2`, … in traversal order.
pub fn build_catalog_with_limit(
    forest: &DescriptorForest,
    max_len: usize,
) -> (ColumnCatalog, HashSet<String>) {
    let problematic = collect_problematic_ids(forest);

    let mut tables: BTreeMap<String, Vec<ColumnSpec>> = BTreeMap::new();
    let mut section_tables = Vec::new();
    let mut has_repeatable_sections = false;
    let mut has_geometry_fields = false;

    tables.insert(TABLE_SUBMISSIONS.to_string(), submission_header_columns());

    let mut field_columns = vec![ColumnSpec::new("submission_number", ColumnType::Int)];
    let mut field_alloc = IdAllocator::default();
    field_alloc.reserve("submission_number");

    for descriptor in &forest.fields {
        if problematic.contains(&descriptor.id) {
            continue;
        }
        match descriptor.kind {
            FieldKind::Repetition => {
                has_repeatable_sections = true;
                let mut columns = section_identity_columns();
                let mut alloc = IdAllocator::default();
                for col in &columns {
                    alloc.reserve(&col.id);
                }

                let mut section_has_geometry = false;
                for inner in &descriptor.sub_descriptors {
                    if problematic.contains(&inner.id) {
                        continue;
                    }
                    if inner.kind == FieldKind::Carte {
                        section_has_geometry = true;
                        has_geometry_fields = true;
                    }
                    push_labeled_columns(&mut columns, &mut alloc, &inner.label, inner, max_len);
                }
                if section_has_geometry {
                    for (id, column_type) in GEO_COLUMNS {
                        if alloc.reserve(id) {
                            columns.push(ColumnSpec::new(id, column_type));
                        }
                    }
                }

                let base = normalize_column_id(&descriptor.label, max_len);
                let mut section = base.clone();
                let mut n = 1usize;
                while tables.contains_key(&section) {
                    section = clamp_column_id_len(format!("{base}_{n}"), max_len);
                    n += 1;
                }
                tables.insert(section.clone(), columns);
                section_tables.push(section);
            }
            FieldKind::Carte => {
                // Top-level geometry sets the flag but never adds the
                // geometry schema to the flat-field table.
                has_geometry_fields = true;
                push_labeled_columns(
                    &mut field_columns,
                    &mut field_alloc,
                    &descriptor.label,
                    descriptor,
                    max_len,
                );
            }
            _ => {
                push_labeled_columns(
                    &mut field_columns,
                    &mut field_alloc,
                    &descriptor.label,
                    descriptor,
                    max_len,
                );
            }
        }
    }
    tables.insert(TABLE_FIELDS.to_string(), field_columns);

    let mut annotation_columns = vec![ColumnSpec::new("submission_number", ColumnType::Int)];
    let mut annotation_alloc = IdAllocator::default();
    annotation_alloc.reserve("submission_number");
    for descriptor in &forest.annotations {
        if problematic.contains(&descriptor.id) || descriptor.kind == FieldKind::Repetition {
            continue;
        }
        let label = descriptor
            .label
            .strip_prefix("annotation_")
            .unwrap_or(&descriptor.label);
        push_labeled_columns(
            &mut annotation_columns,
            &mut annotation_alloc,
            label,
            descriptor,
            max_len,
        );
    }
    tables.insert(TABLE_ANNOTATIONS.to_string(), annotation_columns);

    tables.insert(TABLE_APPLICANTS.to_string(), applicant_columns());
    tables.insert(TABLE_REVIEWERS.to_string(), reviewer_columns());

    (
        ColumnCatalog {
            tables,
            section_tables,
            has_repeatable_sections,
            has_geometry_fields,
        },
        problematic,
    )
}

// ---------------------------------------------------------------------------
// Submission instances
// ---------------------------------------------------------------------------

/// One submitted value conforming to a descriptor kind. Payload fields are
/// kind-specific; absent ones deserialize to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInstance {
    pub id: String,
    #[serde(default)]
    pub descriptor_id: Option<String>,
    #[serde(default)]
    pub kind: FieldKind,
    pub label: String,
    #[serde(default)]
    pub string_value: Option<String>,
    #[serde(default)]
    pub integer_value: Option<i64>,
    #[serde(default)]
    pub decimal_value: Option<f64>,
    #[serde(default)]
    pub checked: Option<bool>,
    #[serde(default)]
    pub date_value: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub files: Vec<AttachedFile>,
    #[serde(default)]
    pub address: Option<AddressPayload>,
    #[serde(default)]
    pub area: Option<AdminArea>,
    #[serde(default)]
    pub company: Option<CompanyPayload>,
    #[serde(default)]
    pub linked_submission: Option<LinkedSubmission>,
    #[serde(default)]
    pub commitment: Option<Commitment>,
    #[serde(default)]
    pub geo_areas: Vec<GeoArea>,
    #[serde(default)]
    pub rows: Vec<SectionIteration>,
}

/// One iteration of a repeatable section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionIteration {
    pub id: String,
    #[serde(default)]
    pub fields: Vec<FieldInstance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedFile {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Structured sub-columns (bank-detail layouts expose these).
    #[serde(default)]
    pub columns: Vec<FileSubColumn>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSubColumn {
    pub label: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressPayload {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Commune / department / region / country / EPCI payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminArea {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub insee_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyPayload {
    pub siret: String,
    #[serde(default)]
    pub legal_name: Option<String>,
    #[serde(default)]
    pub legal_form: Option<String>,
    #[serde(default)]
    pub registration_date: Option<String>,
    #[serde(default)]
    pub administrative_status: Option<String>,
    #[serde(default)]
    pub address: Option<AddressPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkedSubmission {
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commitment {
    #[serde(default)]
    pub committed_amount: Option<f64>,
    #[serde(default)]
    pub paid_amount: Option<f64>,
}

/// One drawn shape of a map field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoArea {
    pub id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub commune: Option<String>,
    #[serde(default)]
    pub parcel_number: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub surface: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionLabel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Applicant of one submission. Organizations carry registry enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Applicant {
    Individual {
        #[serde(default)]
        civility: Option<String>,
        #[serde(default)]
        first_name: Option<String>,
        #[serde(default)]
        last_name: Option<String>,
        #[serde(default)]
        email: Option<String>,
    },
    Organization {
        company: CompanyPayload,
        #[serde(default)]
        email: Option<String>,
    },
}

/// One full hierarchical submission as returned by the source platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub number: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub motivation: Option<String>,
    #[serde(default)]
    pub applicant_email: Option<String>,
    #[serde(default)]
    pub labels: Vec<SubmissionLabel>,
    #[serde(default)]
    pub applicant: Option<Applicant>,
    #[serde(default)]
    pub fields: Vec<FieldInstance>,
    #[serde(default)]
    pub annotations: Vec<FieldInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reviewer {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerGroup {
    pub label: String,
    #[serde(default)]
    pub reviewers: Vec<Reviewer>,
}

// ---------------------------------------------------------------------------
// Flat rows
// ---------------------------------------------------------------------------

/// Identity used to match a flat row against rows the store already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowIdentity {
    /// Main tables: one row per submission.
    Record { submission_number: i64 },
    /// Section tables: one row per section iteration, or per shape for
    /// geometry fan-out rows.
    SectionRow {
        submission_number: i64,
        section: String,
        row_index: i64,
        row_id: String,
        geo: Option<GeoIdentity>,
    },
    /// Reviewer roster rows, diffed by reviewer id.
    Reviewer { reviewer_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoIdentity {
    pub field: String,
    pub geo_id: String,
}

/// One target-table record produced from (parts of) one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRow {
    pub table: String,
    pub fields: BTreeMap<String, JsonValue>,
    pub identity: RowIdentity,
}

impl FlatRow {
    pub fn new(table: impl Into<String>, identity: RowIdentity) -> Self {
        Self {
            table: table.into(),
            fields: BTreeMap::new(),
            identity,
        }
    }

    pub fn set(&mut self, column: impl Into<String>, value: JsonValue) {
        self.fields.insert(column.into(), value);
    }
}

// ---------------------------------------------------------------------------
// Store value formatting
// ---------------------------------------------------------------------------

/// Parse the date shapes the source emits and render the store's canonical
/// `%Y-%m-%dT%H:%M:%SZ`.
pub fn format_datetime_value(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%SZ").to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().format("%Y-%m-%dT%H:%M:%SZ").to_string());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let dt = d.and_hms_opt(0, 0, 0)?;
        return Some(dt.and_utc().format("%Y-%m-%dT%H:%M:%SZ").to_string());
    }
    None
}

/// Heuristic used by type inference: does this string look like an ISO
/// date or datetime?
pub fn looks_like_iso_date(raw: &str) -> bool {
    format_datetime_value(raw).is_some()
}

pub fn truncate_text(value: &str) -> String {
    truncate_chars(value, TEXT_VALUE_LIMIT)
}

pub fn truncate_json_text(value: &str) -> String {
    truncate_chars(value, JSON_VALUE_LIMIT)
}

fn truncate_chars(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let mut out: String = value.chars().take(limit).collect();
    out.push_str("...");
    out
}

pub fn parse_bool_value(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "oui" | "vrai" => Some(true),
        "false" | "0" | "no" | "non" | "faux" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_descriptor(id: &str, kind: FieldKind, label: &str) -> FieldDescriptor {
        FieldDescriptor {
            id: id.to_string(),
            kind,
            label: label.to_string(),
            required: false,
            sub_descriptors: Vec::new(),
        }
    }

    fn mk_section(id: &str, label: &str, inner: Vec<FieldDescriptor>) -> FieldDescriptor {
        FieldDescriptor {
            id: id.to_string(),
            kind: FieldKind::Repetition,
            label: label.to_string(),
            required: false,
            sub_descriptors: inner,
        }
    }

    #[test]
    fn normalization_strips_accents_and_apostrophes() {
        assert_eq!(
            normalize_column_id("Numéro d'identification", MAX_COLUMN_ID_LEN),
            "numero_d_identification"
        );
        assert_eq!(
            normalize_column_id("  Prénom de l’enfant  ", MAX_COLUMN_ID_LEN),
            "prenom_de_l_enfant"
        );
    }

    #[test]
    fn normalization_strips_leading_numbering_but_keeps_inline_digits() {
        assert_eq!(normalize_column_id("1. Nom", MAX_COLUMN_ID_LEN), "nom");
        assert_eq!(normalize_column_id("2 - Adresse", MAX_COLUMN_ID_LEN), "adresse");
        assert_eq!(normalize_column_id("2ème avis", MAX_COLUMN_ID_LEN), "col_2eme_avis");
    }

    #[test]
    fn normalization_prefixes_leading_non_letter() {
        assert_eq!(normalize_column_id("échéance", MAX_COLUMN_ID_LEN), "echeance");
        assert_eq!(normalize_column_id("42", MAX_COLUMN_ID_LEN), "col_42");
        assert_eq!(normalize_column_id("---", MAX_COLUMN_ID_LEN), "col");
    }

    #[test]
    fn normalization_is_idempotent_and_shape_bounded() {
        let samples = [
            "Nom",
            "1. Numéro d'identification du bénéficiaire",
            "Zone géographique (précisez la commune)",
            "RIB / IBAN",
            "",
            "   ",
            "42 questions",
            "Label extrêmement long destiné à dépasser la limite de taille \
             des identifiants de colonnes du magasin cible, avec des accents",
        ];
        for sample in samples {
            let once = normalize_column_id(sample, MAX_COLUMN_ID_LEN);
            let twice = normalize_column_id(&once, MAX_COLUMN_ID_LEN);
            assert_eq!(once, twice, "not idempotent for {sample:?}");
            assert!(once.len() <= MAX_COLUMN_ID_LEN, "too long for {sample:?}");
            assert!(once.as_bytes()[0].is_ascii_lowercase(), "bad start for {sample:?}");
            assert!(
                once.bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_'),
                "bad charset for {sample:?}"
            );
        }
    }

    #[test]
    fn overflowing_ids_get_a_stable_hash_suffix() {
        let label = "a".repeat(120);
        let id = normalize_column_id(&label, MAX_COLUMN_ID_LEN);
        assert_eq!(id.len(), MAX_COLUMN_ID_LEN);
        assert_eq!(id, normalize_column_id(&label, MAX_COLUMN_ID_LEN));
        let other = normalize_column_id(&"b".repeat(120), MAX_COLUMN_ID_LEN);
        assert_ne!(id, other);
    }

    #[test]
    fn tiny_length_limits_still_yield_letter_led_ids() {
        let id = normalize_column_id("Pièces justificatives", 6);
        assert!(id.starts_with("col_"));
        let id = normalize_column_id("Pièces justificatives", 7);
        assert!(id.chars().next().is_some_and(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn classifier_drops_display_only_kinds() {
        let header = mk_descriptor("d1", FieldKind::HeaderSection, "Section 1");
        let explanation = mk_descriptor("d2", FieldKind::Explication, "Lisez ceci");
        assert!(classify(&header).drop);
        assert!(classify(&explanation).drop);
        assert!(!classify(&mk_descriptor("d3", FieldKind::PieceJustificative, "Justificatif")).drop);
    }

    #[test]
    fn bank_detail_attachments_get_four_sub_columns() {
        let rib = mk_descriptor("d1", FieldKind::PieceJustificative, "Votre RIB");
        let classification = classify(&rib);
        let suffixes: Vec<_> = classification.derived.iter().map(|d| d.suffix).collect();
        assert_eq!(suffixes, vec!["titulaire", "iban", "bic", "nom_de_la_banque"]);

        let plain = mk_descriptor("d2", FieldKind::PieceJustificative, "Devis signé");
        assert!(classify(&plain).derived.is_empty());
    }

    #[test]
    fn problematic_ids_recurse_into_sections() {
        let forest = DescriptorForest {
            fields: vec![
                mk_descriptor("h1", FieldKind::HeaderSection, "Intro"),
                mk_section(
                    "rep",
                    "Enfants",
                    vec![
                        mk_descriptor("h2", FieldKind::Explication, "Aide"),
                        mk_descriptor("f1", FieldKind::Text, "Prénom"),
                    ],
                ),
            ],
            annotations: vec![mk_descriptor("h3", FieldKind::HeaderSection, "Notes")],
        };
        let ids = collect_problematic_ids(&forest);
        assert_eq!(
            ids,
            HashSet::from(["h1".to_string(), "h2".to_string(), "h3".to_string()])
        );
    }

    #[test]
    fn catalog_scenario_text_field_plus_section() {
        let forest = DescriptorForest {
            fields: vec![
                mk_descriptor("f1", FieldKind::Text, "Nom"),
                mk_section(
                    "rep",
                    "Enfants",
                    vec![mk_descriptor("f2", FieldKind::Text, "Prénom")],
                ),
            ],
            annotations: Vec::new(),
        };
        let (catalog, _) = build_catalog(&forest);

        let fields = catalog.columns(TABLE_FIELDS).unwrap();
        assert!(fields.iter().any(|c| c.id == "nom"));

        let section = catalog.columns("enfants").unwrap();
        let ids: Vec<_> = section.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["record_key", "row_index", "row_id", "prenom"]);
        assert!(catalog.has_repeatable_sections);
        assert_eq!(catalog.section_tables, vec!["enfants".to_string()]);
    }

    #[test]
    fn catalog_collisions_get_numeric_suffixes_in_order() {
        let forest = DescriptorForest {
            fields: vec![
                mk_descriptor("f1", FieldKind::Text, "Commentaire"),
                mk_descriptor("f2", FieldKind::Text, "Commentaire"),
                mk_descriptor("f3", FieldKind::Text, "Commentaire"),
            ],
            annotations: Vec::new(),
        };
        let (catalog, _) = build_catalog(&forest);
        let ids: Vec<_> = catalog
            .columns(TABLE_FIELDS)
            .unwrap()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(
            ids,
            vec!["submission_number", "commentaire", "commentaire_1", "commentaire_2"]
        );
    }

    #[test]
    fn catalog_never_emits_duplicate_ids() {
        let forest = DescriptorForest {
            fields: vec![
                mk_descriptor("f1", FieldKind::Communes, "Commune"),
                mk_descriptor("f2", FieldKind::Text, "Commune"),
                mk_descriptor("f3", FieldKind::PieceJustificative, "RIB"),
                mk_descriptor("f4", FieldKind::Address, "Adresse"),
            ],
            annotations: vec![mk_descriptor("a1", FieldKind::Text, "annotation_Avis")],
        };
        let (catalog, _) = build_catalog(&forest);
        for (table, columns) in &catalog.tables {
            let mut seen = HashSet::new();
            for col in columns {
                assert!(seen.insert(&col.id), "duplicate {} in {table}", col.id);
            }
        }
        // annotation_ prefix dropped before normalization
        assert!(catalog.has_column(TABLE_ANNOTATIONS, "avis"));
        assert!(catalog.has_column(TABLE_FIELDS, "commune_postal_code"));
        assert!(catalog.has_column(TABLE_FIELDS, "commune_department"));
        assert!(catalog.has_column(TABLE_FIELDS, "commune_insee_code"));
        assert!(catalog.has_column(TABLE_FIELDS, "rib_iban"));
        assert!(catalog.has_column(TABLE_FIELDS, "rib_bic"));
        // structured kinds get a JSON shadow column
        assert!(catalog.has_column(TABLE_FIELDS, "adresse_json"));
    }

    #[test]
    fn geometry_columns_only_on_sections_that_contain_a_map() {
        let forest = DescriptorForest {
            fields: vec![
                mk_descriptor("f1", FieldKind::Carte, "Zone"),
                mk_section(
                    "rep1",
                    "Parcelles",
                    vec![mk_descriptor("f2", FieldKind::Carte, "Emprise")],
                ),
                mk_section("rep2", "Contacts", vec![mk_descriptor("f3", FieldKind::Text, "Nom")]),
            ],
            annotations: Vec::new(),
        };
        let (catalog, _) = build_catalog(&forest);
        assert!(catalog.has_geometry_fields);
        assert!(catalog.has_column("parcelles", "geo_wkt"));
        assert!(!catalog.has_column("contacts", "geo_wkt"));
        // flag set by the top-level map, but no geometry schema on the flat table
        assert!(!catalog.has_column(TABLE_FIELDS, "geo_wkt"));
        assert!(catalog.has_column(TABLE_FIELDS, "zone"));
    }

    #[test]
    fn datetime_formatting_accepts_multiple_shapes() {
        assert_eq!(
            format_datetime_value("2024-03-05T10:30:00+02:00").as_deref(),
            Some("2024-03-05T08:30:00Z")
        );
        assert_eq!(
            format_datetime_value("2024-03-05 10:30:00").as_deref(),
            Some("2024-03-05T10:30:00Z")
        );
        assert_eq!(
            format_datetime_value("2024-03-05").as_deref(),
            Some("2024-03-05T00:00:00Z")
        );
        assert_eq!(format_datetime_value("pas une date"), None);
    }

    #[test]
    fn bool_parsing_accepts_french_spellings() {
        assert_eq!(parse_bool_value("Oui"), Some(true));
        assert_eq!(parse_bool_value("vrai"), Some(true));
        assert_eq!(parse_bool_value("non"), Some(false));
        assert_eq!(parse_bool_value("peut-être"), None);
    }

    #[test]
    fn text_truncation_appends_ellipsis() {
        let long = "x".repeat(TEXT_VALUE_LIMIT + 5);
        let truncated = truncate_text(&long);
        assert_eq!(truncated.chars().count(), TEXT_VALUE_LIMIT + 3);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_text("court"), "court");
    }

    #[test]
    fn field_kind_wire_tags_round_trip() {
        let kind: FieldKind = serde_json::from_str("\"integer_number\"").unwrap();
        assert_eq!(kind, FieldKind::IntegerNumber);
        let kind: FieldKind = serde_json::from_str("\"civilite\"").unwrap();
        assert_eq!(kind, FieldKind::Civility);
        let kind: FieldKind = serde_json::from_str("\"some_future_kind\"").unwrap();
        assert_eq!(kind, FieldKind::Unknown);
    }
}
