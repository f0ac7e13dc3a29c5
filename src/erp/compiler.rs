// ABOUTME: Compiles a TableSpec into the ERP's XML report-definition request
// ABOUTME: Renders nested parts/lines per collection segment and typed field expressions

use chrono::NaiveDate;
use regex::Regex;
use std::fmt::Write;
use std::sync::OnceLock;

use crate::error::SyncResult;
use crate::table_spec::{FieldDescriptor, SemanticType, TableSpec};

/// Report ID sent in the envelope header and used as the TDL report name.
pub const REPORT_ID: &str = "ReplicatorReport";

/// Field appended to every line to close the line/field index ranges.
pub const FILLER_FIELD: &str = "FldBlank";

/// Character the ERP emits for an empty value (`ñ`, char code 241).
pub const BLANK_SENTINEL: &str = "\u{f1}";

/// Static variables sent with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Company to run the report against; the ERP's current company when unset
    pub company: Option<String>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\.\.)?[A-Za-z0-9_]+$").expect("identifier pattern is a valid regex")
    })
}

/// Whether `source` is a bare method name (optionally parent-relative with `..`).
pub fn is_identifier(source: &str) -> bool {
    identifier_pattern().is_match(source)
}

/// Render the ERP-side expression for one field.
///
/// Bare identifiers are wrapped according to the field's semantic type.
/// Anything else is taken to be a complete ERP expression and passed through.
pub fn field_expression(field: &FieldDescriptor) -> String {
    let source = field.source.trim();
    if !is_identifier(source) {
        return source.to_string();
    }

    let r = format!("${}", source);
    match field.semantic_type {
        SemanticType::Text => r,
        SemanticType::Logical => format!("if {r} then 1 else 0"),
        SemanticType::Date => format!(
            "if $$IsEmpty:{r} then $$StrByCharCode:241 else $$PyrlYYYYMMDDFormat:{r}:\"-\""
        ),
        SemanticType::Number => {
            format!("if $$IsEmpty:{r} then $$StrByCharCode:241 else $$String:{r}")
        }
        SemanticType::Amount => format!(
            "$$StringFindAndReplace:(if $$IsDebit:{r} then -$$NumValue:{r} else $$NumValue:{r}):\"(-)\":\"-\""
        ),
        SemanticType::Quantity => format!(
            "$$StringFindAndReplace:(if $$IsInwards:{r} then $$Number:$$String:{r}:\"TailUnits\" else -$$Number:$$String:{r}:\"TailUnits\"):\"(-)\":\"-\""
        ),
        SemanticType::Rate => format!("if $$IsEmpty:{r} then 0 else $$Number:{r}"),
    }
}

/// Render a collection filter. Bare identifiers become method references.
pub fn filter_expression(filter: &str) -> String {
    let filter = filter.trim();
    if is_identifier(filter) {
        format!("${}", filter)
    } else {
        filter.to_string()
    }
}

/// Compile a table descriptor into a complete XML request.
///
/// Output is deterministic: the same spec and options always produce the same bytes.
/// Fails with a configuration error, before any I/O, if the spec is malformed.
pub fn compile(spec: &TableSpec, options: &RequestOptions) -> SyncResult<String> {
    spec.validate()?;
    let path = spec.collection_path();

    let mut xml = String::with_capacity(2048);
    xml.push_str("<?xml version=\"1.0\" encoding=\"utf-16\"?>");
    xml.push_str("<ENVELOPE><HEADER><VERSION>1</VERSION><TALLYREQUEST>Export</TALLYREQUEST>");
    let _ = write!(xml, "<TYPE>Data</TYPE><ID>{}</ID></HEADER>", REPORT_ID);
    xml.push_str("<BODY><DESC><STATICVARIABLES>");
    xml.push_str("<SVEXPORTFORMAT>$$SysName:XML</SVEXPORTFORMAT>");
    if let Some(company) = &options.company {
        let _ = write!(
            xml,
            "<SVCURRENTCOMPANY>{}</SVCURRENTCOMPANY>",
            escape_xml(company)
        );
    }
    if let Some(from) = options.from_date {
        let _ = write!(xml, "<SVFROMDATE>{}</SVFROMDATE>", from.format("%Y%m%d"));
    }
    if let Some(to) = options.to_date {
        let _ = write!(xml, "<SVTODATE>{}</SVTODATE>", to.format("%Y%m%d"));
    }
    xml.push_str("</STATICVARIABLES><TDL><TDLMESSAGE>");

    let _ = write!(
        xml,
        "<REPORT NAME=\"{}\"><FORMS>MyForm</FORMS></REPORT>",
        REPORT_ID
    );
    xml.push_str("<FORM NAME=\"MyForm\"><PARTS>MyPart01</PARTS></FORM>");

    // One part per path segment; each repeats its line over the next level down.
    for (i, segment) in path.iter().enumerate() {
        let level = i + 1;
        let repeat_over = if i == 0 { "MyCollection" } else { segment };
        let _ = write!(
            xml,
            "<PART NAME=\"MyPart{level:02}\"><LINES>MyLine{level:02}</LINES>\
             <REPEAT>MyLine{level:02} : {repeat_over}</REPEAT><SCROLLED>Vertical</SCROLLED></PART>"
        );
    }

    for level in 1..=path.len() {
        if level < path.len() {
            let _ = write!(
                xml,
                "<LINE NAME=\"MyLine{level:02}\"><FIELDS>{FILLER_FIELD}</FIELDS>\
                 <EXPLODE>MyPart{next:02}</EXPLODE></LINE>",
                next = level + 1
            );
        } else {
            let mut names: Vec<String> = (1..=spec.fields.len())
                .map(|n| format!("Fld{n:02}"))
                .collect();
            names.push(FILLER_FIELD.to_string());
            let _ = write!(
                xml,
                "<LINE NAME=\"MyLine{level:02}\"><FIELDS>{}</FIELDS></LINE>",
                names.join(",")
            );
        }
    }

    for (i, field) in spec.fields.iter().enumerate() {
        let n = i + 1;
        let _ = write!(
            xml,
            "<FIELD NAME=\"Fld{n:02}\"><SET>{}</SET><XMLTAG>F{n:02}</XMLTAG></FIELD>",
            escape_xml(&field_expression(field))
        );
    }
    let _ = write!(
        xml,
        "<FIELD NAME=\"{FILLER_FIELD}\"><SET>\"\"</SET></FIELD>"
    );

    let _ = write!(
        xml,
        "<COLLECTION NAME=\"MyCollection\"><TYPE>{}</TYPE>",
        escape_xml(path[0])
    );
    if !spec.fetch.is_empty() {
        let fetch: Vec<&str> = spec.fetch.iter().map(|f| f.trim()).collect();
        let _ = write!(xml, "<FETCH>{}</FETCH>", escape_xml(&fetch.join(",")));
    }
    if !spec.filters.is_empty() {
        let names: Vec<String> = (1..=spec.filters.len())
            .map(|n| format!("Fltr{n:02}"))
            .collect();
        let _ = write!(xml, "<FILTER>{}</FILTER>", names.join(","));
    }
    xml.push_str("</COLLECTION>");

    for (i, filter) in spec.filters.iter().enumerate() {
        let _ = write!(
            xml,
            "<SYSTEM TYPE=\"Formulae\" NAME=\"Fltr{:02}\">{}</SYSTEM>",
            i + 1,
            escape_xml(&filter_expression(filter))
        );
    }

    xml.push_str("</TDLMESSAGE></TDL></DESC></BODY></ENVELOPE>");
    Ok(xml)
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::table_spec::Partition;

    fn ledger_spec() -> TableSpec {
        TableSpec::new("ledgers", Partition::Master, "Ledger")
            .field("guid", "Guid", SemanticType::Text)
            .field("name", "Name", SemanticType::Text)
            .field("is_revenue", "IsRevenue", SemanticType::Logical)
            .field("opening_balance", "OpeningBalance", SemanticType::Amount)
            .fetch("OpeningBalance")
            .filter("NOT $IsCancelled")
    }

    #[test]
    fn test_compile_is_deterministic() {
        let options = RequestOptions {
            company: Some("Acme Traders".to_string()),
            ..Default::default()
        };
        let first = compile(&ledger_spec(), &options).unwrap();
        let second = compile(&ledger_spec(), &options).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_compile_flat_collection() {
        let xml = compile(&ledger_spec(), &RequestOptions::default()).unwrap();
        assert!(xml.contains("<REPEAT>MyLine01 : MyCollection</REPEAT>"));
        assert!(xml.contains("<FIELDS>Fld01,Fld02,Fld03,Fld04,FldBlank</FIELDS>"));
        assert!(xml.contains("<FIELD NAME=\"Fld01\"><SET>$Guid</SET><XMLTAG>F01</XMLTAG></FIELD>"));
        assert!(xml.contains("<SET>if $IsRevenue then 1 else 0</SET>"));
        assert!(xml.contains("$$IsDebit:$OpeningBalance"));
        assert!(xml.contains("<TYPE>Ledger</TYPE><FETCH>OpeningBalance</FETCH><FILTER>Fltr01</FILTER>"));
        assert!(xml.contains("<SYSTEM TYPE=\"Formulae\" NAME=\"Fltr01\">NOT $IsCancelled</SYSTEM>"));
        assert!(!xml.contains("SVCURRENTCOMPANY"));
    }

    #[test]
    fn test_compile_nested_collection() {
        let spec = TableSpec::new("ledger_entries", Partition::Transaction, "Voucher.AllLedgerEntries")
            .field("guid", "..Guid", SemanticType::Text)
            .field("ledger", "LedgerName", SemanticType::Text)
            .field("amount", "Amount", SemanticType::Amount);
        let xml = compile(&spec, &RequestOptions::default()).unwrap();

        assert!(xml.contains("<REPEAT>MyLine01 : MyCollection</REPEAT>"));
        assert!(xml.contains("<REPEAT>MyLine02 : AllLedgerEntries</REPEAT>"));
        assert!(xml.contains(
            "<LINE NAME=\"MyLine01\"><FIELDS>FldBlank</FIELDS><EXPLODE>MyPart02</EXPLODE></LINE>"
        ));
        assert!(xml.contains("<LINE NAME=\"MyLine02\"><FIELDS>Fld01,Fld02,Fld03,FldBlank</FIELDS></LINE>"));
        assert!(xml.contains("<SET>$..Guid</SET>"));
        assert!(xml.contains("<TYPE>Voucher</TYPE>"));
    }

    #[test]
    fn test_compile_missing_collection_fails_fast() {
        let mut spec = ledger_spec();
        spec.collection.clear();
        let err = compile(&spec, &RequestOptions::default()).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn test_filters_keep_declaration_order() {
        let spec = ledger_spec().filter("IsRevenue").filter("$AlterID > 42");
        let xml = compile(&spec, &RequestOptions::default()).unwrap();
        assert!(xml.contains("<FILTER>Fltr01,Fltr02,Fltr03</FILTER>"));
        let first = xml.find("NAME=\"Fltr01\">NOT $IsCancelled").unwrap();
        let second = xml.find("NAME=\"Fltr02\">$IsRevenue").unwrap();
        let third = xml.find("NAME=\"Fltr03\">$AlterID &gt; 42").unwrap();
        assert!(first < second && second < third);
    }

    #[test]
    fn test_static_variables() {
        let options = RequestOptions {
            company: Some("R&D Ltd".to_string()),
            from_date: NaiveDate::from_ymd_opt(2024, 4, 1),
            to_date: NaiveDate::from_ymd_opt(2025, 3, 31),
        };
        let xml = compile(&ledger_spec(), &options).unwrap();
        assert!(xml.contains("<SVCURRENTCOMPANY>R&amp;D Ltd</SVCURRENTCOMPANY>"));
        assert!(xml.contains("<SVFROMDATE>20240401</SVFROMDATE>"));
        assert!(xml.contains("<SVTODATE>20250331</SVTODATE>"));
    }

    #[test]
    fn test_field_expression_per_type() {
        let date = FieldDescriptor::new("date", "Date", SemanticType::Date);
        assert_eq!(
            field_expression(&date),
            "if $$IsEmpty:$Date then $$StrByCharCode:241 else $$PyrlYYYYMMDDFormat:$Date:\"-\""
        );

        let qty = FieldDescriptor::new("qty", "ActualQty", SemanticType::Quantity);
        assert!(field_expression(&qty).contains("$$IsInwards:$ActualQty"));

        let rate = FieldDescriptor::new("rate", "Rate", SemanticType::Rate);
        assert_eq!(field_expression(&rate), "if $$IsEmpty:$Rate then 0 else $$Number:$Rate");

        let number = FieldDescriptor::new("alter_id", "AlterID", SemanticType::Number);
        assert!(field_expression(&number).starts_with("if $$IsEmpty:$AlterID"));

        // Non-identifiers are already complete expressions
        let verbatim = FieldDescriptor::new(
            "parent",
            "if $$IsEqual:$Parent:$$SysName:Primary then \"\" else $Parent",
            SemanticType::Text,
        );
        assert_eq!(field_expression(&verbatim), verbatim.source);
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("Guid"));
        assert!(is_identifier("..Guid"));
        assert!(is_identifier("Alter_ID2"));
        assert!(!is_identifier("$Guid"));
        assert!(!is_identifier("...Guid"));
        assert!(!is_identifier("Parent.Name"));
        assert!(!is_identifier(""));
    }
}
