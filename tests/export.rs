mod common;

use captable_io::{
    data::{Record, Value},
    decode::{self, DecodeOptions},
    export::{
        self, DataType, ExportTemplate, FilterOperator, SortDirection, TemplateCalculation,
        TemplateField, TemplateFilter, TemplateFormatting, TemplateGrouping,
    },
    schema::TargetSchema,
};
use common::TestWorkspace;

fn holders() -> Vec<Record> {
    let entries: [(&str, &str, f64, f64); 4] = [
        ("Ada Lovelace", "Common", 1500.0, 1.25),
        ("Grace Hopper", "Preferred", 2500.0, 4.00),
        ("Edsger Dijkstra", "Common", 750.0, 1.25),
        ("Barbara Liskov", "Preferred", 100.0, 4.00),
    ];
    entries
        .iter()
        .map(|(name, class, shares, price)| {
            let mut record = Record::new();
            record.set("name", Value::String(name.to_string()));
            record.set("share_class", Value::String(class.to_string()));
            record.set("share_count", Value::Number(*shares));
            record.set("price_per_share", Value::Number(*price));
            record
        })
        .collect()
}

fn holdings_template() -> ExportTemplate {
    ExportTemplate {
        name: "Holdings Report".to_string(),
        schema: TargetSchema::Shareholders,
        fields: vec![
            TemplateField {
                source_field: "name".to_string(),
                display_name: "Shareholder".to_string(),
                data_type: DataType::String,
                transformation: None,
                default_value: None,
            },
            TemplateField {
                source_field: "share_class".to_string(),
                display_name: "Class".to_string(),
                data_type: DataType::String,
                transformation: None,
                default_value: None,
            },
            TemplateField {
                source_field: "share_count".to_string(),
                display_name: "Shares".to_string(),
                data_type: DataType::Number,
                transformation: None,
                default_value: None,
            },
            TemplateField {
                source_field: "price_per_share".to_string(),
                display_name: "Price".to_string(),
                data_type: DataType::Currency,
                transformation: None,
                default_value: None,
            },
        ],
        formatting: TemplateFormatting::default(),
        filters: Vec::new(),
        grouping: None,
        calculations: Vec::new(),
    }
}

#[test]
fn full_template_filters_groups_and_computes() {
    let mut template = holdings_template();
    template.filters = vec![TemplateFilter {
        field: "share_count".to_string(),
        operator: FilterOperator::GreaterThan,
        value: Some(Value::Number(500.0)),
        second_value: None,
        values: None,
    }];
    template.grouping = Some(TemplateGrouping {
        field: "share_class".to_string(),
        direction: SortDirection::Ascending,
        subtotals: true,
        subtotal_fields: vec!["Shares".to_string()],
    });
    template.calculations = vec![TemplateCalculation {
        display_name: "Value".to_string(),
        formula: "{share_count} * {price_per_share}".to_string(),
    }];

    let sheet = export::generate(&holders(), &template);

    // Barbara (100 shares) is filtered out; 3 data rows + 2 subtotal rows.
    assert_eq!(sheet.record_count, 3);
    assert_eq!(sheet.rows.len(), 5);
    assert_eq!(
        sheet.headers,
        vec!["Shareholder", "Class", "Shares", "Price", "Value"]
    );

    let subtotals: Vec<_> = sheet.rows.iter().filter(|r| r.is_subtotal).collect();
    assert_eq!(subtotals[0].cells[0], "Subtotal: Common");
    assert_eq!(subtotals[0].cells[2], "2250");
    assert_eq!(subtotals[1].cells[0], "Subtotal: Preferred");
    assert_eq!(subtotals[1].cells[2], "2500");

    let ada = sheet
        .rows
        .iter()
        .find(|r| r.cells[0] == "Ada Lovelace")
        .unwrap();
    assert_eq!(ada.cells[3], "$1.25");
    assert_eq!(ada.cells[4], "1875");
}

#[test]
fn repeated_exports_are_byte_identical_without_metadata() {
    let mut template = holdings_template();
    template.grouping = Some(TemplateGrouping {
        field: "name".to_string(),
        direction: SortDirection::Descending,
        subtotals: false,
        subtotal_fields: Vec::new(),
    });

    let records = holders();
    let mut first = Vec::new();
    export::render_csv(&export::generate(&records, &template), &mut first, false).unwrap();
    let mut second = Vec::new();
    export::render_csv(&export::generate(&records, &template), &mut second, false).unwrap();

    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn workbook_output_decodes_back_with_an_info_sheet() {
    let workspace = TestWorkspace::new();
    let path = workspace.path().join("holdings.xlsx");
    let template = holdings_template();
    let sheet = export::generate(&holders(), &template);
    export::render_workbook(&sheet, &path).unwrap();

    let data = decode::decode(&path, &DecodeOptions::default()).unwrap();
    assert_eq!(
        data.headers,
        vec!["Shareholder", "Class", "Shares", "Price"]
    );
    assert_eq!(data.rows.len(), 4);
    assert_eq!(
        data.rows[0].get("Shareholder"),
        Some(&Value::String("Ada Lovelace".to_string()))
    );

    let info_options = DecodeOptions {
        sheet: Some("Export Info".to_string()),
        has_headers: false,
        ..DecodeOptions::default()
    };
    let info = decode::decode(&path, &info_options).unwrap();
    assert_eq!(
        info.rows[0].get("column_1"),
        Some(&Value::String("Template".to_string()))
    );
    assert_eq!(
        info.rows[0].get("column_2"),
        Some(&Value::String("Holdings Report".to_string()))
    );
}

#[test]
fn template_files_round_trip_through_json() {
    let workspace = TestWorkspace::new();
    let mut template = holdings_template();
    template.filters = vec![TemplateFilter {
        field: "share_class".to_string(),
        operator: FilterOperator::In,
        value: None,
        second_value: None,
        values: Some(vec![Value::String("Common".to_string())]),
    }];
    let path = workspace.write(
        "template.json",
        &serde_json::to_string_pretty(&template).unwrap(),
    );

    let loaded: ExportTemplate =
        serde_json::from_reader(std::fs::File::open(&path).unwrap()).unwrap();
    assert_eq!(loaded.name, "Holdings Report");
    assert_eq!(loaded.filters[0].operator, FilterOperator::In);

    let sheet = export::generate(&holders(), &loaded);
    assert_eq!(sheet.record_count, 2);
}
