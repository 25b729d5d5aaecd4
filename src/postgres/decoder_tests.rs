#[cfg(test)]
mod tests {
    use super::super::decoder::*;
    use super::super::types::{Column, Lsn, Operation, TableName, Value};
    use serde_json::json;
    use std::collections::HashMap;

    fn whiskies() -> TableName {
        TableName::new("public", "whiskies")
    }

    fn countries() -> TableName {
        TableName::new("public", "countries")
    }

    fn create_decoder() -> Wal2JsonDecoder {
        let mut schemas = HashMap::new();
        schemas.insert(
            whiskies(),
            vec![
                Column::new("id", "integer"),
                Column::new("name", "text"),
                Column::new("age", "smallint"),
                Column::new("country_id", "integer"),
            ],
        );
        schemas.insert(
            countries(),
            vec![Column::new("id", "integer"), Column::new("name", "text")],
        );
        Wal2JsonDecoder::new(schemas)
    }

    fn insert(table: &str, names: &[&str], values: serde_json::Value) -> serde_json::Value {
        json!({
            "kind": "insert",
            "schema": "public",
            "table": table,
            "columnnames": names,
            "columntypes": [],
            "columnvalues": values,
        })
    }

    fn update(
        table: &str,
        names: &[&str],
        values: serde_json::Value,
        keys: &[&str],
        key_values: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "kind": "update",
            "schema": "public",
            "table": table,
            "columnnames": names,
            "columnvalues": values,
            "oldkeys": { "keynames": keys, "keytypes": [], "keyvalues": key_values },
        })
    }

    fn delete(table: &str, keys: &[&str], key_values: serde_json::Value) -> serde_json::Value {
        json!({
            "kind": "delete",
            "schema": "public",
            "table": table,
            "oldkeys": { "keynames": keys, "keyvalues": key_values },
        })
    }

    fn payload_at(nextlsn: &str, changes: Vec<serde_json::Value>) -> Vec<u8> {
        serde_json::to_vec(&json!({ "nextlsn": nextlsn, "change": changes })).unwrap()
    }

    fn payload(changes: Vec<serde_json::Value>) -> Vec<u8> {
        payload_at("0/1", changes)
    }

    #[test]
    fn test_decode_insert_leaves_old_slots_empty() {
        let decoder = create_decoder();
        let data = payload_at(
            "0/64",
            vec![insert("countries", &["id", "name"], json!([6, "Jamaica"]))],
        );

        let tx = decoder.decode_transaction(&data).unwrap();
        assert_eq!(tx.flush_position, Lsn(100));
        assert_eq!(tx.changesets.len(), 1);

        let changeset = &tx.changesets[0];
        assert_eq!(changeset.table, countries());
        assert_eq!(changeset.operation, Operation::Insert);
        assert_eq!(changeset.columns.len(), 4);
        assert_eq!(
            changeset.rows,
            vec![vec![
                Value::Int(6),
                Value::Text("Jamaica".to_string()),
                Value::Null,
                Value::Null,
            ]]
        );
    }

    #[test]
    fn test_decode_update_pairs_new_and_old_values() {
        let decoder = create_decoder();
        let names = ["id", "name", "age", "country_id"];
        let data = payload(vec![update(
            "whiskies",
            &names,
            json!([1, "Lagavulin 16", 16, 2]),
            &names,
            json!([1, "Lagavulin", 12, 2]),
        )]);

        let tx = decoder.decode_transaction(&data).unwrap();
        let changeset = &tx.changesets[0];
        assert_eq!(changeset.operation, Operation::Update);

        let column_names: Vec<_> = changeset.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            column_names,
            vec!["id", "name", "age", "country_id", "old__id", "old__name", "old__age", "old__country_id"]
        );

        let row = &changeset.rows[0];
        assert_eq!(row.len(), 8);
        assert!(row.iter().all(|value| !value.is_null()));
        assert_eq!(row[1], Value::Text("Lagavulin 16".to_string()));
        assert_eq!(row[2], Value::Int(16));
        assert_eq!(row[5], Value::Text("Lagavulin".to_string()));
        assert_eq!(row[6], Value::Int(12));
    }

    #[test]
    fn test_decode_update_with_key_only_identity() {
        let decoder = create_decoder();
        let data = payload(vec![update(
            "countries",
            &["id", "name"],
            json!([3, "Scotland"]),
            &["id"],
            json!([3]),
        )]);

        let tx = decoder.decode_transaction(&data).unwrap();
        let row = &tx.changesets[0].rows[0];
        assert_eq!(row[2], Value::Int(3));
        assert_eq!(row[3], Value::Null);
    }

    #[test]
    fn test_decode_delete_leaves_new_slots_empty() {
        let decoder = create_decoder();
        let data = payload(vec![delete("countries", &["id", "name"], json!([5, "USA"]))]);

        let tx = decoder.decode_transaction(&data).unwrap();
        let changeset = &tx.changesets[0];
        assert_eq!(changeset.operation, Operation::Delete);
        assert_eq!(
            changeset.rows[0],
            vec![
                Value::Null,
                Value::Null,
                Value::Int(5),
                Value::Text("USA".to_string()),
            ]
        );
    }

    #[test]
    fn test_contiguous_runs_are_coalesced_in_order() {
        let decoder = create_decoder();
        let data = payload(vec![
            insert("countries", &["id", "name"], json!([6, "Jamaica"])),
            insert("countries", &["id", "name"], json!([7, "Japan"])),
            insert("whiskies", &["id", "name"], json!([9, "Yamazaki"])),
            delete("countries", &["id"], json!([7])),
            insert("countries", &["id", "name"], json!([8, "Chile"])),
        ]);

        let tx = decoder.decode_transaction(&data).unwrap();
        let shape: Vec<_> = tx
            .changesets
            .iter()
            .map(|c| (c.table.name.as_str(), c.operation, c.rows.len()))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("countries", Operation::Insert, 2),
                ("whiskies", Operation::Insert, 1),
                ("countries", Operation::Delete, 1),
                ("countries", Operation::Insert, 1),
            ]
        );
        assert_eq!(tx.changesets[0].rows[1][1], Value::Text("Japan".to_string()));
    }

    #[test]
    fn test_empty_transaction_has_no_changesets() {
        let decoder = create_decoder();
        let tx = decoder
            .decode_transaction(b"{\"nextlsn\":\"0/1F4\",\"change\":[]}")
            .unwrap();
        assert!(tx.changesets.is_empty());
        assert_eq!(tx.flush_position, Lsn(500));
    }

    #[test]
    fn test_unknown_kind_is_fatal() {
        let decoder = create_decoder();
        let data = payload(vec![json!({
            "kind": "message",
            "transactional": false,
            "prefix": "truck",
            "content": "hello",
        })]);

        let err = decoder.decode_transaction(&data).unwrap_err();
        assert!(err.to_string().contains("unknown operation kind 'message'"));
    }

    #[test]
    fn test_unknown_table_is_fatal() {
        let decoder = create_decoder();
        let data = payload(vec![insert("distilleries", &["id"], json!([1]))]);
        assert!(decoder.decode_transaction(&data).is_err());
    }

    #[test]
    fn test_unknown_column_is_fatal() {
        let decoder = create_decoder();
        let data = payload(vec![insert("countries", &["id", "flag"], json!([1, "x"]))]);
        let err = decoder.decode_transaction(&data).unwrap_err();
        assert!(err.to_string().contains("unknown column 'flag'"));
    }

    #[test]
    fn test_delete_without_old_keys_is_fatal() {
        let decoder = create_decoder();
        let data = payload(vec![json!({
            "kind": "delete",
            "schema": "public",
            "table": "countries",
        })]);
        assert!(decoder.decode_transaction(&data).is_err());
    }

    #[test]
    fn test_malformed_payload_is_fatal() {
        let decoder = create_decoder();
        assert!(decoder.decode_transaction(b"{\"change\":[").is_err());
    }

    #[test]
    fn test_position_is_commit_end_not_arrival_order() {
        let decoder = create_decoder();
        let committed_first = payload_at(
            "0/180",
            vec![insert("countries", &["id", "name"], json!([2, "Spain"]))],
        );
        let committed_second = payload_at(
            "1/20",
            vec![insert("countries", &["id", "name"], json!([1, "Portugal"]))],
        );

        let first = decoder.decode_transaction(&committed_first).unwrap();
        let second = decoder.decode_transaction(&committed_second).unwrap();
        assert_eq!(first.flush_position, Lsn(0x180));
        assert_eq!(second.flush_position, Lsn(0x1_0000_0020));
        assert!(first.flush_position < second.flush_position);
    }

    #[test]
    fn test_missing_nextlsn_is_fatal() {
        let decoder = create_decoder();
        let err = decoder
            .decode_transaction(b"{\"change\":[]}")
            .unwrap_err();
        assert!(err.to_string().contains("nextlsn"));
    }

    #[test]
    fn test_wide_numeric_keeps_every_digit() {
        let mut schemas = HashMap::new();
        schemas.insert(
            TableName::new("public", "balances"),
            vec![Column::new("id", "integer"), Column::new("amount", "numeric(30,9)")],
        );
        let decoder = Wal2JsonDecoder::new(schemas);
        let data = br#"{"nextlsn":"0/10","change":[{"kind":"insert","schema":"public","table":"balances","columnnames":["id","amount"],"columnvalues":[1,12345678901234567890.123456789]}]}"#;

        let tx = decoder.decode_transaction(data).unwrap();
        assert_eq!(
            tx.changesets[0].rows[0][1],
            Value::Text("12345678901234567890.123456789".to_string())
        );
    }

    #[test]
    fn test_iterator_stops_after_first_error() {
        let decoder = create_decoder();
        let records = Wal2JsonDecoder::parse(&payload(vec![
            insert("countries", &["id", "name"], json!([1, "Portugal"])),
            insert("whiskies", &["id", "age"], json!([1, "old"])),
            insert("countries", &["id", "name"], json!([2, "Spain"])),
        ]))
        .unwrap();

        let results: Vec<_> = decoder.changesets(records).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
