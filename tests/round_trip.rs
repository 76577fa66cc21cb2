use bytes::Bytes;
use sheet_insight::models::{Cell, CellValue, FileFormat, Sheet, Workbook, WorkbookMetadata};
use sheet_insight::services::converter::{compare, from_engine_model, to_engine_model, validate_round_trip, DEFAULT_SAMPLE_LIMIT};
use sheet_insight::services::excel::sources::load_workbook;
use sheet_insight::services::excel::StreamWriter;

fn mixed_rows() -> Vec<Vec<Cell>> {
    (0..40)
        .map(|i| {
            vec![
                Cell::value(CellValue::Number(i as f64 * 1.5)),
                Cell::value(CellValue::Text(format!("item {}", i))),
                Cell::value(CellValue::Boolean(i % 2 == 0)),
                Cell::formula(format!("=A{}*2", i + 1), CellValue::Empty),
            ]
        })
        .collect()
}

#[test]
fn in_memory_workbook_round_trips() {
    let workbook = Workbook {
        metadata: WorkbookMetadata::new(FileFormat::Xlsx, &[]),
        sheets: vec![Sheet::new("Data", mixed_rows())],
    };

    let report = validate_round_trip(&workbook, DEFAULT_SAMPLE_LIMIT).unwrap();

    assert_eq!(report.sampled, 160);
    assert!(report.valid);
    assert!(1.0 - report.mismatch_rate >= 0.99);
}

#[test]
fn written_workbook_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.xlsx");
    let mut writer = StreamWriter::create(&path, FileFormat::Xlsx, "Data").unwrap();
    for row in mixed_rows() {
        writer.append_row(&row).unwrap();
    }
    assert_eq!(writer.finish().unwrap(), 40);

    let data = Bytes::from(std::fs::read(&path).unwrap());
    let workbook = load_workbook(&data, FileFormat::Xlsx).unwrap();
    let report = validate_round_trip(&workbook, DEFAULT_SAMPLE_LIMIT).unwrap();

    assert!(report.valid);
    assert!(1.0 - report.mismatch_rate >= 0.99);
    assert!(report.errors.is_empty());
}

#[test]
fn heavy_divergence_is_invalid() {
    let workbook = Workbook {
        metadata: WorkbookMetadata::new(FileFormat::Csv, &[]),
        sheets: vec![Sheet::new("Data", mixed_rows())],
    };
    let mut returned = from_engine_model(&to_engine_model(&workbook)).unwrap();
    for row in returned[0].rows.iter_mut() {
        row[1] = Cell::value(CellValue::Text("changed".into()));
    }

    let report = compare(&workbook, &returned, DEFAULT_SAMPLE_LIMIT);

    assert!(!report.valid);
    assert_eq!(report.mismatches, 40);
    assert!(!report.errors.is_empty());
}
