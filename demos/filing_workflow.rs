use budget_fact_engine::{
    Draft, EngineConfig, FactCorrections, FactEngine, FactScope, FactStore, LineItem, ManualRow,
    ManualValue, RawTable, Stage,
};

fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| row.iter().map(|c| c.to_string()).collect())
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let engine = FactEngine::new(EngineConfig::from_json_str(
        r#"{ "validation": { "required_manual_keys": ["revenue_explanation", "three_public_explanation"] } }"#,
    )?)?;
    let mut store = FactStore::open_in_memory()?;
    let scope = FactScope::new("U-042", 2024, Stage::Budget);

    let tables = vec![
        RawTable::new(
            "summary",
            grid(&[
                &["部门收支总表"],
                &["单位：万元"],
                &["本年收入合计", "1280.5", "本年支出合计", "1280.52"],
                &["财政拨款收入", "1180.5", "基本支出", "960.5"],
                &["其他收入", "100", "项目支出", "320"],
            ]),
        ),
        RawTable::new(
            "unknown",
            grid(&[
                &["“三公”经费预算表"],
                &["单位：元"],
                &["合计", "因公出国（境）费", "公务用车购置及运行费", "公务用车购置费", "公务用车运行费", "公务接待费"],
                &["合计", "125000", "20000", "60000", "40000", "20000", "45000"],
            ]),
        ),
    ];
    let manual_rows = vec![
        ManualRow::new("公务接待费", 45000.0),
        ManualRow::new("机关运行经费（万元）", 210.0),
        ManualRow::new("资产配置说明", 2.0),
    ];

    let report = engine.reconcile(&mut store, &scope, &tables, &manual_rows)?;
    println!("Facts written: {}", report.facts_written.len());
    for table in &report.table_scales {
        println!(" - table '{}' read as {:?} ({:?})", table.table_key, table.scale.unit, table.scale.basis);
    }
    for conflict in &report.conflicts {
        println!(
            " - conflict on {}: kept {} ({:?}), rejected {} ({:?})",
            conflict.key, conflict.kept_value, conflict.kept_source, conflict.rejected_value, conflict.kind
        );
    }
    for unmatched in &report.unmatched_labels {
        println!(" - no key for '{}'", unmatched.label);
    }

    store.save_draft(&Draft {
        draft_id: "DRAFT-2024-042".to_string(),
        unit_id: scope.unit_id.clone(),
        year: scope.year,
        stage: scope.stage,
    })?;
    store.set_manual_input(
        "DRAFT-2024-042",
        "revenue_explanation",
        &ManualValue::Text("2024年收入预算1280.5万元，较上年增加，主要是财政拨款增加。".to_string()),
    )?;
    store.replace_line_items(
        "DRAFT-2024-042",
        &[LineItem {
            code: "2010301".to_string(),
            name: "行政运行".to_string(),
            current_amount: 960.5,
            prior_amount: Some(700.0),
            reason_text: None,
            reason_is_auto: false,
        }],
    )?;

    let summary = engine.validate_draft(&mut store, "DRAFT-2024-042")?;
    println!(
        "\nValidation: {} fatal, {} warning, {} suggest",
        summary.fatal_count, summary.warning_count, summary.suggest_count
    );
    for issue in &summary.issues {
        println!(" [{}] {}: {}", issue.level, issue.rule_id, issue.message);
    }

    let corrections = FactCorrections::from_json_str(
        r#"{"corrections": [
            {"action": "set_value", "key": "budget_expenditure_total", "value": 1280.5, "note": "按原件更正"},
            {"action": "lock", "key": "budget_expenditure_total"}
        ]}"#,
    )?;
    let corrected = engine.apply_corrections(&mut store, &scope, &corrections)?;
    println!("\nCorrected: {:?}, locked: {:?}", corrected.written, corrected.locked);

    let summary = engine.validate_draft(&mut store, "DRAFT-2024-042")?;
    if summary.blocks_generation() {
        println!("Generation blocked by {} fatal issues", summary.fatal_count);
    } else {
        println!("Draft is ready for generation");
    }

    Ok(())
}
