// Integration tests for anonymous records
//
// Records made by one function are passed to another as arguments, the way
// a query feeds one call's `record` result into the next.

mod common;

use common::*;
use pgext::host::fmgr::TupleDesc;
use pgext::host::pg_type::*;
use pgext::{
    Arena, CurrentArena, Datum, Error, FromDatum, IntoDatum, NullableDatum, OwnedArena, Record,
    SetOf, Type, pg_function,
};

fn person_desc() -> TupleDesc {
    TupleDesc::with_names([("name", TEXTOID), ("age", INT4OID)])
}

pg_function!(make_person, |name: String, age: i32| {
    Record::from_row(person_desc(), (name, age), &CurrentArena)
});

pg_function!(person_age, |person: Record| person.get_by_name::<i32>("age"));

pg_function!(field_at, |row: Record, index: usize| row.get::<Option<String>>(index));

pg_function!(field_named, |row: Record, name: String| {
    row.get_by_name::<Option<String>>(&name)
});

pg_function!(describe, |row: Record| -> Result<SetOf<Vec<(String, String)>>, Error> {
    let fields = (0..row.attributes())
        .map(|index| {
            Ok((
                row.attribute_name(index)?.to_string(),
                row.attribute_type(index)?.display_name(),
            ))
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(SetOf::new(fields))
});

pg_function!(people, |n: i32| -> Result<SetOf<Vec<Record>>, Error> {
    let rows = (1..=n)
        .map(|i| Record::from_row(person_desc(), (format!("person {i}"), i * 10), &CurrentArena))
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(SetOf::new(rows))
});

fn text(s: &str) -> NullableDatum {
    s.into_nullable_datum().unwrap()
}

fn person(name: &str, age: i64) -> NullableDatum {
    let oid = register("make_person", make_person, &[TEXTOID, INT4OID], RECORDOID);
    call(oid, &[text(name), int(age)]).unwrap()
}

fn as_string(word: usize, arena: &impl Arena) -> String {
    String::from_datum(Datum::from_word(word), Type::TEXT, arena.borrowed()).unwrap()
}

// ============================================================================
// Records as arguments and results
// ============================================================================

mod argument_tests {
    use super::*;

    #[test]
    fn test_record_round_trips_through_calls() {
        let ada = person("ada", 36);
        assert!(!ada.is_null());

        let oid = register("person_age", person_age, &[RECORDOID], INT4OID);
        let age = call(oid, &[ada]).unwrap();
        assert_eq!(age.get().unwrap().to_i64(), 36);
    }

    #[test]
    fn test_descriptor_travels_with_tuple() {
        let ada = person("ada", 36);
        let record = Record::from_nullable_datum(ada, Type::RECORD, pgext::BorrowedArena::current()).unwrap();

        assert!(record.desc().is_blessed());
        assert!(record.desc().same_row_type(&person_desc()));
        assert_eq!(record.get_by_name::<String>("name").unwrap(), "ada");
    }

    #[test]
    fn test_null_record_argument() {
        let oid = register("person_age", person_age, &[RECORDOID], INT4OID);
        assert_eq!(
            call(oid, &[NullableDatum::null()]).unwrap_err(),
            "exception: value is null and can't be coerced into Record"
        );
    }

    #[test]
    fn test_attribute_out_of_bounds() {
        let oid = register("field_at", field_at, &[RECORDOID, INT8OID], TEXTOID);
        let err = call(oid, &[person("ada", 36), int(5)]).unwrap_err();
        assert_eq!(
            err,
            "exception: attribute index 5 is out of bounds for record with the size of 2"
        );
    }

    #[test]
    fn test_unknown_attribute_name() {
        let oid = register("field_named", field_named, &[RECORDOID, TEXTOID], TEXTOID);
        let err = call(oid, &[person("ada", 36), text("nickname")]).unwrap_err();
        assert_eq!(err, "exception: no attribute by the name of nickname");

        let name = call(oid, &[person("ada", 36), text("name")]).unwrap();
        let arena = OwnedArena::new("reader").unwrap();
        assert_eq!(as_string(name.get().unwrap().word(), &arena), "ada");
    }
}

// ============================================================================
// Records in sets
// ============================================================================

mod set_tests {
    use super::*;

    #[test]
    fn test_describe_lists_attributes() {
        let oid = register_set("describe", describe, &[RECORDOID], RECORDOID);
        let arena = OwnedArena::new("per-query").unwrap();
        let row = Record::from_row(
            TupleDesc::new(vec![INT8OID, BOOLOID, TEXTOID]),
            (1_i64, true, "x".to_string()),
            &arena,
        )
        .unwrap();

        let store = call_set(oid, &[row.into_nullable_datum().unwrap()], None, &arena).unwrap();
        let listed: Vec<(String, String)> = store
            .rows()
            .iter()
            .map(|r| (as_string(r[0].value, &arena), as_string(r[1].value, &arena)))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("f1".to_string(), "bigint".to_string()),
                ("f2".to_string(), "boolean".to_string()),
                ("f3".to_string(), "text".to_string()),
            ]
        );
    }

    #[test]
    fn test_record_rows_are_materialized() {
        let oid = register_set("people", people, &[INT4OID], RECORDOID);
        let arena = OwnedArena::new("per-query").unwrap();
        let store = call_set(oid, &[int(3)], Some(TupleDesc::new(vec![TEXTOID, INT4OID])), &arena).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(as_string(store.rows()[2][0].value, &arena), "person 3");
        assert_eq!(store.rows()[2][1].value, 30);
    }

    #[test]
    fn test_record_rows_checked_against_caller() {
        let oid = register_set("people", people, &[INT4OID], RECORDOID);
        let arena = OwnedArena::new("per-query").unwrap();

        let err = call_set(oid, &[int(1)], Some(TupleDesc::new(vec![TEXTOID])), &arena).unwrap_err();
        assert_eq!(err, "exception: expected set with 1 value, got 2 instead");

        let err = call_set(oid, &[int(1)], Some(TupleDesc::new(vec![TEXTOID, INT8OID])), &arena).unwrap_err();
        assert_eq!(
            err,
            "exception: invalid type in record's position 1 (integer), got OID 20"
        );
    }
}
