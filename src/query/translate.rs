//! Lowering of the query algebra to parameterised SQL.
//!
//! The translator is a pure function of `(query, options, schema)`. Field
//! references resolve to the generated column when the schema indexes the
//! field and to an in-JSON `json_extract` otherwise; every runtime value
//! becomes an `@pN` (filter) or `@optN` (limit/offset) parameter, listed in
//! binding order.

use std::fmt::Write;

use itertools::Itertools;

use crate::error::{FractalError, Result};
use crate::options::{QueryOptions, SearchOptions, SortOrder};
use crate::query::{simplify, ArrayOp, CompareOp, FieldOp, Query, StringOp};
use crate::schema::{default_path, SchemaFields};
use crate::sql::SqlWriter;
use crate::value::Value;

/// A SQL fragment plus its parameters. Each placeholder occurs exactly
/// once in `sql`, in the order it appears in `params`.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatorResult {
    pub sql: String,
    pub params: Vec<(String, Value)>,
}

pub(crate) struct Translator<'a> {
    schema: &'a SchemaFields,
}

/// What a field name inside a filter refers to: the document itself, or
/// the current array element inside an `elem_match` subquery.
#[derive(Clone, Copy)]
enum Scope {
    Document,
    Element,
}

#[derive(Default)]
struct Lowering {
    params: Vec<(String, Value)>,
    opt_count: usize,
}

impl Lowering {
    fn push_param(&mut self, value: Value) -> String {
        let name = format!("@p{}", self.params.len() - self.opt_count);
        self.params.push((name.clone(), value));
        name
    }

    fn push_opt(&mut self, value: i64) -> String {
        let name = format!("@opt{}", self.opt_count);
        self.opt_count += 1;
        self.params.push((name.clone(), Value::Int(value)));
        name
    }
}

impl<'a> Translator<'a> {
    pub fn new(schema: &'a SchemaFields) -> Self {
        Self { schema }
    }

    /// Lowers the filter alone; the result composes after `WHERE`.
    pub fn translate_filter(&self, query: &Query) -> Result<TranslatorResult> {
        let mut lowering = Lowering::default();
        let sql = self.lower(&simplify(query.clone()), Scope::Document, &mut lowering)?;
        Ok(TranslatorResult {
            sql,
            params: lowering.params,
        })
    }

    /// Lowers filter and options into one fragment:
    /// `<where> [ORDER BY ...] [LIMIT @optN] [OFFSET @optN]`.
    pub fn translate(&self, query: &Query, opts: &QueryOptions) -> Result<TranslatorResult> {
        opts.validate()?;
        let mut lowering = Lowering::default();

        let mut conjuncts = Vec::new();
        match simplify(query.clone()) {
            Query::Empty => {}
            q => conjuncts.push(self.lower(&q, Scope::Document, &mut lowering)?),
        }
        if let Some(search) = &opts.search {
            if let Some(sql) = self.lower_search(search, &mut lowering) {
                conjuncts.push(sql);
            }
        }

        let mut reverse_sort = false;
        if let Some(cursor) = &opts.cursor {
            // Validation guarantees a sort key and exactly one position.
            let (field, order) = &opts.sort[0];
            let (position, forward) = match (&cursor.after, &cursor.before) {
                (Some(v), None) => (v, true),
                (None, Some(v)) => (v, false),
                _ => unreachable!("validated by QueryOptions::validate"),
            };
            reverse_sort = !forward;
            let ascending = *order == SortOrder::Asc;
            let op = if ascending == forward { ">" } else { "<" };
            let param = lowering.push_param(position.clone());
            conjuncts.push(format!("{} {} {}", self.resolve(field), op, param));
        }

        let mut sql = if conjuncts.is_empty() {
            "1=1".to_owned()
        } else {
            conjuncts.join(" AND ")
        };

        if !opts.sort.is_empty() {
            let order_by = opts
                .sort
                .iter()
                .map(|(field, order)| {
                    let order = if reverse_sort { order.reversed() } else { *order };
                    format!("{} {}", self.resolve(field), order.keyword())
                })
                .join(", ");
            write!(sql, " ORDER BY {}", order_by).expect("formatting failed");
        }

        match (opts.limit, opts.skip) {
            (Some(limit), None) => {
                let p = lowering.push_opt(limit as i64);
                write!(sql, " LIMIT {}", p).expect("formatting failed");
            }
            (Some(limit), Some(skip)) => {
                let limit_p = lowering.push_opt(limit as i64);
                let skip_p = lowering.push_opt(skip as i64);
                write!(sql, " LIMIT {} OFFSET {}", limit_p, skip_p).expect("formatting failed");
            }
            (None, Some(skip)) => {
                // SQLite has no standalone OFFSET.
                let p = lowering.push_opt(skip as i64);
                write!(sql, " LIMIT -1 OFFSET {}", p).expect("formatting failed");
            }
            (None, None) => {}
        }

        Ok(TranslatorResult {
            sql,
            params: lowering.params,
        })
    }

    /// Resolves a logical field name to the SQL expression that reads it:
    /// metadata column, generated column, or in-JSON extraction.
    pub fn resolve(&self, field: &str) -> String {
        match field {
            "id" => "_id".to_owned(),
            "created_at" | "updated_at" => field.to_owned(),
            _ => match self.schema.field(field) {
                Some(def) if def.indexed => def.column_name(),
                _ => format!("json_extract(body, {})", path_literal(&self.json_path(field))),
            },
        }
    }

    /// JSON path of a field inside the body: the declared path, or
    /// `$.<name>` (dotted names become nested paths).
    fn json_path(&self, field: &str) -> String {
        match self.schema.field(field) {
            Some(def) => def.path.clone(),
            None => default_path(field),
        }
    }

    fn lower(&self, query: &Query, scope: Scope, lowering: &mut Lowering) -> Result<String> {
        match query {
            Query::Empty => Ok("1=1".to_owned()),
            Query::Field { field, op } => self.lower_field(field, op, scope, lowering),
            Query::And(qs) => self.lower_connective(qs, "AND", scope, lowering),
            Query::Or(qs) => self.lower_connective(qs, "OR", scope, lowering),
            Query::Nor(qs) => {
                if qs.is_empty() {
                    return Ok("1=1".to_owned());
                }
                let inner = self.lower_connective(qs, "OR", scope, lowering)?;
                Ok(format!("NOT {}", ensure_parens(inner)))
            }
            Query::Not(q) => {
                let inner = self.lower(q, scope, lowering)?;
                Ok(format!("NOT {}", ensure_parens(inner)))
            }
        }
    }

    fn lower_connective(
        &self,
        queries: &[Query],
        joiner: &str,
        scope: Scope,
        lowering: &mut Lowering,
    ) -> Result<String> {
        match queries {
            [] => Ok("1=1".to_owned()),
            [q] => self.lower(q, scope, lowering),
            qs => {
                let parts: Vec<String> = qs
                    .iter()
                    .map(|q| self.lower(q, scope, lowering))
                    .collect::<Result<_>>()?;
                Ok(format!("({})", parts.join(&format!(" {} ", joiner))))
            }
        }
    }

    fn lower_field(
        &self,
        field: &str,
        op: &FieldOp,
        scope: Scope,
        lowering: &mut Lowering,
    ) -> Result<String> {
        let column = self.resolve_scoped(field, scope);
        match op {
            FieldOp::Compare(cmp) => Ok(self.lower_compare(&column, cmp, lowering)),
            FieldOp::String(op) => Ok(lower_string_op(&column, op, lowering)),
            FieldOp::Exists(true) => Ok(format!("{} IS NOT NULL", column)),
            FieldOp::Exists(false) => Ok(format!("{} IS NULL", column)),
            FieldOp::Array(op) => self.lower_array(field, op, scope, lowering),
        }
    }

    fn resolve_scoped(&self, field: &str, scope: Scope) -> String {
        match scope {
            Scope::Document => self.resolve(field),
            // Inside elem_match the filter runs over the json_each row; an
            // empty name (or `value`) is the element itself, anything else
            // a property of it.
            Scope::Element => {
                if field.is_empty() || field == "value" {
                    "value".to_owned()
                } else {
                    format!(
                        "json_extract(value, {})",
                        path_literal(&default_path(field))
                    )
                }
            }
        }
    }

    fn lower_compare(&self, column: &str, cmp: &CompareOp, lowering: &mut Lowering) -> String {
        let binary = |lowering: &mut Lowering, op: &str, value: &Value| {
            let param = lowering.push_param(value.clone());
            format!("{} {} {}", column, op, param)
        };
        match cmp {
            CompareOp::Eq(v) => binary(lowering, "=", v),
            CompareOp::Ne(v) => binary(lowering, "!=", v),
            CompareOp::Gt(v) => binary(lowering, ">", v),
            CompareOp::Gte(v) => binary(lowering, ">=", v),
            CompareOp::Lt(v) => binary(lowering, "<", v),
            CompareOp::Lte(v) => binary(lowering, "<=", v),
            CompareOp::In(vs) if vs.is_empty() => "0=1".to_owned(),
            CompareOp::In(vs) => {
                let params = vs.iter().map(|v| lowering.push_param(v.clone())).join(", ");
                format!("{} IN ({})", column, params)
            }
            CompareOp::NotIn(vs) if vs.is_empty() => "1=1".to_owned(),
            CompareOp::NotIn(vs) => {
                let params = vs.iter().map(|v| lowering.push_param(v.clone())).join(", ");
                format!("{} NOT IN ({})", column, params)
            }
        }
    }

    fn lower_array(
        &self,
        field: &str,
        op: &ArrayOp,
        scope: Scope,
        lowering: &mut Lowering,
    ) -> Result<String> {
        // Array operators always address the JSON document, not the
        // generated column.
        let (doc, path) = match scope {
            Scope::Document => ("body", self.json_path(field)),
            Scope::Element => ("value", default_path(field)),
        };
        let path = path_literal(&path);
        match op {
            ArrayOp::Size(n) => {
                let param = lowering.push_param(Value::Int(*n as i64));
                Ok(format!("json_array_length({}, {}) = {}", doc, path, param))
            }
            ArrayOp::All(vs) if vs.is_empty() => Ok("1=1".to_owned()),
            ArrayOp::All(vs) => {
                let clauses: Vec<String> = vs
                    .iter()
                    .map(|v| {
                        let param = lowering.push_param(v.clone());
                        format!(
                            "EXISTS (SELECT 1 FROM json_each({}, {}) WHERE value = {})",
                            doc, path, param
                        )
                    })
                    .collect();
                if clauses.len() == 1 {
                    Ok(clauses.into_iter().next().unwrap())
                } else {
                    Ok(format!("({})", clauses.join(" AND ")))
                }
            }
            ArrayOp::Index(i, v) => {
                let indexed_path = path_literal(&format!("{}[{}]", self.scoped_path(field, scope), i));
                let param = lowering.push_param(v.clone());
                Ok(format!("json_extract({}, {}) = {}", doc, indexed_path, param))
            }
            ArrayOp::ElemMatch(inner) => {
                if matches!(simplify((**inner).clone()), Query::Empty) {
                    return Err(FractalError::query(
                        "elem_match requires a non-empty inner filter",
                    ));
                }
                let inner_sql = self.lower(inner, Scope::Element, lowering)?;
                Ok(format!(
                    "EXISTS (SELECT 1 FROM json_each({}, {}) WHERE {})",
                    doc, path, inner_sql
                ))
            }
        }
    }

    fn scoped_path(&self, field: &str, scope: Scope) -> String {
        match scope {
            Scope::Document => self.json_path(field),
            Scope::Element => default_path(field),
        }
    }

    fn lower_search(&self, search: &SearchOptions, lowering: &mut Lowering) -> Option<String> {
        if search.fields.is_empty() || search.text.is_empty() {
            return None;
        }
        let needle = format!("%{}%", search.text);
        let clauses: Vec<String> = search
            .fields
            .iter()
            .map(|field| {
                let column = self.resolve(field);
                let param = lowering.push_param(Value::Text(needle.clone()));
                if search.case_sensitive {
                    format!("{} LIKE {}", column, param)
                } else {
                    format!("lower({}) LIKE lower({})", column, param)
                }
            })
            .collect();
        if clauses.len() == 1 {
            Some(clauses.into_iter().next().unwrap())
        } else {
            Some(format!("({})", clauses.join(" OR ")))
        }
    }
}

fn lower_string_op(column: &str, op: &StringOp, lowering: &mut Lowering) -> String {
    match op {
        StringOp::Like(pattern) => {
            let param = lowering.push_param(Value::Text(pattern.clone()));
            format!("{} LIKE {}", column, param)
        }
        StringOp::ILike(pattern) => {
            let param = lowering.push_param(Value::Text(pattern.clone()));
            format!("lower({}) LIKE lower({})", column, param)
        }
        StringOp::Contains(s) => {
            let param = lowering.push_param(Value::Text(format!("%{}%", s)));
            format!("{} LIKE {}", column, param)
        }
        StringOp::StartsWith(s) => {
            let param = lowering.push_param(Value::Text(format!("{}%", s)));
            format!("{} LIKE {}", column, param)
        }
        StringOp::EndsWith(s) => {
            let param = lowering.push_param(Value::Text(format!("%{}", s)));
            format!("{} LIKE {}", column, param)
        }
    }
}

fn ensure_parens(sql: String) -> String {
    if sql.starts_with('(') && sql.ends_with(')') {
        sql
    } else {
        format!("({})", sql)
    }
}

/// JSON paths land in the SQL text as string literals; quote them safely.
fn path_literal(path: &str) -> String {
    let mut w = SqlWriter::new();
    w.push_literal(path);
    w.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{
        all, and, at_index, elem_match, eq, exists, gt, ilike, is_in, not, not_in, or, size,
        starts_with,
    };
    use crate::schema::{FieldDef, Schema, SqlType};

    fn test_schema() -> Schema<()> {
        Schema::builder()
            .field(FieldDef::new("age", SqlType::Integer).indexed())
            .field(FieldDef::new("email", SqlType::Text).unique())
            .field(FieldDef::new("name", SqlType::Text))
            .build()
            .unwrap()
    }

    fn translate_filter(q: &Query) -> TranslatorResult {
        let schema = test_schema();
        Translator::new(&schema.fields).translate_filter(q).unwrap()
    }

    fn translate(q: &Query, opts: &QueryOptions) -> TranslatorResult {
        let schema = test_schema();
        Translator::new(&schema.fields).translate(q, opts).unwrap()
    }

    /// Each parameter name must occur exactly once in the SQL text.
    fn assert_params_bound_once(result: &TranslatorResult) {
        for (name, _) in &result.params {
            let occurrences = result
                .sql
                .match_indices(name.as_str())
                .filter(|(idx, _)| {
                    let after = result.sql[idx + name.len()..].chars().next();
                    !matches!(after, Some(c) if c.is_ascii_digit())
                })
                .count();
            assert_eq!(occurrences, 1, "{} in {}", name, result.sql);
        }
    }

    #[test]
    fn empty_query_is_trivially_true() {
        let r = translate_filter(&Query::Empty);
        assert_eq!(r.sql, "1=1");
        assert!(r.params.is_empty());
    }

    #[test]
    fn indexed_field_uses_generated_column() {
        let r = translate_filter(&eq("age", 30));
        assert_eq!(r.sql, "_age = @p0");
        assert_eq!(r.params, vec![("@p0".into(), Value::Int(30))]);
    }

    #[test]
    fn non_indexed_field_extracts_from_json() {
        let r = translate_filter(&eq("name", "Alice"));
        assert_eq!(r.sql, "json_extract(body, '$.name') = @p0");
    }

    #[test]
    fn unknown_field_is_lenient() {
        let r = translate_filter(&eq("nickname", "Al"));
        assert_eq!(r.sql, "json_extract(body, '$.nickname') = @p0");
    }

    #[test]
    fn dotted_field_extracts_nested_path() {
        let r = translate_filter(&eq("address.city", "Oslo"));
        assert_eq!(r.sql, "json_extract(body, '$.address.city') = @p0");
    }

    #[test]
    fn metadata_fields_use_their_columns() {
        assert_eq!(translate_filter(&eq("id", "x")).sql, "_id = @p0");
        assert_eq!(translate_filter(&gt("created_at", 5)).sql, "created_at > @p0");
        assert_eq!(translate_filter(&gt("updated_at", 5)).sql, "updated_at > @p0");
    }

    #[test]
    fn in_lists_enumerate_params() {
        let r = translate_filter(&is_in("age", [1, 2, 3]));
        assert_eq!(r.sql, "_age IN (@p0, @p1, @p2)");
        assert_eq!(r.params.len(), 3);
        assert_params_bound_once(&r);

        let r = translate_filter(&not_in("age", [1, 2]));
        assert_eq!(r.sql, "_age NOT IN (@p0, @p1)");
    }

    #[test]
    fn empty_in_is_false_empty_not_in_is_true() {
        assert_eq!(translate_filter(&is_in("age", Vec::<i64>::new())).sql, "0=1");
        assert_eq!(translate_filter(&not_in("age", Vec::<i64>::new())).sql, "1=1");
    }

    #[test]
    fn string_operators_wrap_patterns() {
        let r = translate_filter(&starts_with("email", "a@"));
        assert_eq!(r.sql, "_email LIKE @p0");
        assert_eq!(r.params[0].1, Value::Text("a@%".into()));

        let r = translate_filter(&ilike("email", "A@B"));
        assert_eq!(r.sql, "lower(_email) LIKE lower(@p0)");
    }

    #[test]
    fn exists_checks_null() {
        assert_eq!(translate_filter(&exists("age", true)).sql, "_age IS NOT NULL");
        assert_eq!(translate_filter(&exists("age", false)).sql, "_age IS NULL");
    }

    #[test]
    fn connectives_join_and_parenthesize() {
        let r = translate_filter(&and([eq("age", 1), eq("name", "x"), eq("email", "y")]));
        assert_eq!(
            r.sql,
            "(_age = @p0 AND json_extract(body, '$.name') = @p1 AND _email = @p2)"
        );
        assert_params_bound_once(&r);

        let r = translate_filter(&or([eq("age", 1), eq("age", 2)]));
        assert_eq!(r.sql, "(_age = @p0 OR _age = @p1)");

        let r = translate_filter(&crate::query::nor([eq("age", 1), eq("age", 2)]));
        assert_eq!(r.sql, "NOT (_age = @p0 OR _age = @p1)");

        let r = translate_filter(&not(eq("age", 1)));
        assert_eq!(r.sql, "NOT (_age = @p0)");
    }

    #[test]
    fn simplified_and_raw_trees_translate_identically() {
        let raw = and([or([eq("age", 1)]), and([]), not(not(eq("name", "x")))]);
        let simplified = simplify(raw.clone());
        assert_eq!(translate_filter(&raw), translate_filter(&simplified));
    }

    #[test]
    fn array_size_uses_json_array_length() {
        let r = translate_filter(&size("tags", 0));
        assert_eq!(r.sql, "json_array_length(body, '$.tags') = @p0");
        assert_eq!(r.params[0].1, Value::Int(0));
    }

    #[test]
    fn array_all_emits_exists_per_element() {
        let r = translate_filter(&all("tags", ["a", "b"]));
        assert_eq!(
            r.sql,
            "(EXISTS (SELECT 1 FROM json_each(body, '$.tags') WHERE value = @p0) \
             AND EXISTS (SELECT 1 FROM json_each(body, '$.tags') WHERE value = @p1))"
        );
        assert_params_bound_once(&r);
    }

    #[test]
    fn array_index_addresses_fixed_position() {
        let r = translate_filter(&at_index("tags", 2, "x"));
        assert_eq!(r.sql, "json_extract(body, '$.tags[2]') = @p0");
    }

    #[test]
    fn elem_match_scopes_fields_to_the_element() {
        let r = translate_filter(&elem_match("items", eq("value", 3)));
        assert_eq!(
            r.sql,
            "EXISTS (SELECT 1 FROM json_each(body, '$.items') WHERE value = @p0)"
        );

        // Sibling fields inside one element resolve against the element.
        let r = translate_filter(&elem_match(
            "items",
            and([eq("sku", "a"), gt("qty", 2)]),
        ));
        assert_eq!(
            r.sql,
            "EXISTS (SELECT 1 FROM json_each(body, '$.items') WHERE \
             (json_extract(value, '$.sku') = @p0 AND json_extract(value, '$.qty') > @p1))"
        );
        assert_params_bound_once(&r);
    }

    #[test]
    fn elem_match_rejects_empty_inner_filter() {
        let schema = test_schema();
        let err = Translator::new(&schema.fields)
            .translate_filter(&elem_match("items", Query::Empty))
            .unwrap_err();
        assert!(matches!(err, FractalError::Query { .. }));
    }

    #[test]
    fn options_append_order_limit_offset() {
        let opts = QueryOptions::new()
            .sort("age", SortOrder::Desc)
            .sort("id", SortOrder::Asc)
            .limit(10)
            .skip(5);
        let r = translate(&eq("name", "x"), &opts);
        assert_eq!(
            r.sql,
            "json_extract(body, '$.name') = @p0 \
             ORDER BY _age DESC, _id ASC LIMIT @opt0 OFFSET @opt1"
        );
        assert_eq!(r.params[1], ("@opt0".into(), Value::Int(10)));
        assert_eq!(r.params[2], ("@opt1".into(), Value::Int(5)));
        assert_params_bound_once(&r);
    }

    #[test]
    fn skip_without_limit_keeps_sqlite_happy() {
        let opts = QueryOptions::new().skip(4);
        let r = translate(&Query::Empty, &opts);
        assert_eq!(r.sql, "1=1 LIMIT -1 OFFSET @opt0");
    }

    #[test]
    fn cursor_after_adds_conjunct_on_first_sort_key() {
        let opts = QueryOptions::new().sort("age", SortOrder::Asc).after(30);
        let r = translate(&Query::Empty, &opts);
        assert_eq!(r.sql, "_age > @p0 ORDER BY _age ASC");
        assert_eq!(r.params[0].1, Value::Int(30));

        let opts = QueryOptions::new().sort("age", SortOrder::Desc).after(30);
        let r = translate(&Query::Empty, &opts);
        assert_eq!(r.sql, "_age < @p0 ORDER BY _age DESC");
    }

    #[test]
    fn cursor_before_flips_comparison_and_sort() {
        let opts = QueryOptions::new().sort("age", SortOrder::Asc).before(30);
        let r = translate(&Query::Empty, &opts);
        assert_eq!(r.sql, "_age < @p0 ORDER BY _age DESC");
    }

    #[test]
    fn search_folds_into_where() {
        let opts = QueryOptions::new().search("ann", ["name", "email"]);
        let r = translate(&eq("age", 3), &opts);
        assert_eq!(
            r.sql,
            "_age = @p0 AND (lower(json_extract(body, '$.name')) LIKE lower(@p1) \
             OR lower(_email) LIKE lower(@p2))"
        );
        assert_eq!(r.params[1].1, Value::Text("%ann%".into()));
        assert_params_bound_once(&r);
    }

    #[test]
    fn translation_is_deterministic() {
        let q = and([eq("age", 3), ilike("name", "a%")]);
        let opts = QueryOptions::new().sort("id", SortOrder::Asc).limit(2);
        assert_eq!(translate(&q, &opts), translate(&q, &opts));
    }
}
