//! Request validator — schema-checked parse of a decoded body into a
//! [`CardRequest`].
//!
//! Pure: no I/O, no logging. Every required field must be present and
//! coercible to its declared type; unknown fields are ignored. All offending
//! fields are reported, not just the first.

use serde_json::{Map, Value};

use crate::error::{FieldIssue, FieldProblem, ValidationError};
use crate::pipeline::types::CardRequest;

/// Validate a decoded message body.
pub fn validate(body: &Value) -> Result<CardRequest, ValidationError> {
    let map = body.as_object().ok_or(ValidationError::NotAnObject)?;
    let mut fields = Fields::new(map);

    let user_id = fields.integer("userId");
    let app_id = fields.string("app_id");
    let card_type = fields.string("cardType");
    let card_category = fields.string("cardCategory");
    let card_balance = fields.number("cardBalance");
    let currency = fields.string("currency");
    let first_name = fields.string("firstName");
    let last_name = fields.string("lastName");
    let card_request_id = fields.integer("cardRequestId");
    let phone = fields.string("phone");

    match (
        user_id,
        app_id,
        card_type,
        card_category,
        card_balance,
        currency,
        first_name,
        last_name,
        card_request_id,
        phone,
    ) {
        (
            Some(user_id),
            Some(app_id),
            Some(card_type),
            Some(card_category),
            Some(card_balance),
            Some(currency),
            Some(first_name),
            Some(last_name),
            Some(card_request_id),
            Some(phone),
        ) => Ok(CardRequest {
            user_id,
            app_id,
            card_type,
            card_category,
            card_balance,
            currency,
            first_name,
            last_name,
            card_request_id,
            phone,
        }),
        _ => Err(ValidationError::Fields(fields.issues)),
    }
}

/// Field reader that records every problem it meets.
struct Fields<'a> {
    map: &'a Map<String, Value>,
    issues: Vec<FieldIssue>,
}

impl<'a> Fields<'a> {
    fn new(map: &'a Map<String, Value>) -> Self {
        Self {
            map,
            issues: Vec::new(),
        }
    }

    fn read<T>(
        &mut self,
        field: &'static str,
        expected: &'static str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> Option<T> {
        let problem = match self.map.get(field) {
            None | Some(Value::Null) => FieldProblem::Missing,
            Some(value) => match convert(value) {
                Some(converted) => return Some(converted),
                None => FieldProblem::WrongType { expected },
            },
        };
        self.issues.push(FieldIssue { field, problem });
        None
    }

    fn string(&mut self, field: &'static str) -> Option<String> {
        self.read(field, "string", |v| v.as_str().map(str::to_owned))
    }

    /// Integers. A float with no fractional part, or a string holding such a
    /// number, is accepted as well.
    fn integer(&mut self, field: &'static str) -> Option<i64> {
        self.read(field, "integer", |v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral))
            }
            _ => None,
        })
    }

    /// Any JSON number, or a string holding a finite one.
    fn number(&mut self, field: &'static str) -> Option<f64> {
        self.read(field, "number", |v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        })
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn valid_body() -> Value {
        json!({
            "userId": 1,
            "cardRequestId": 100,
            "phone": "+1",
            "cardType": "debit",
            "cardCategory": "standard",
            "cardBalance": 0.0,
            "currency": "USD",
            "firstName": "A",
            "lastName": "B",
            "app_id": "x"
        })
    }

    #[test]
    fn valid_body_maps_every_field_verbatim() {
        let request = validate(&valid_body()).unwrap();

        assert_eq!(request.user_id, 1);
        assert_eq!(request.card_request_id, 100);
        assert_eq!(request.phone, "+1");
        assert_eq!(request.card_type, "debit");
        assert_eq!(request.card_category, "standard");
        assert_eq!(request.card_balance, 0.0);
        assert_eq!(request.currency, "USD");
        assert_eq!(request.first_name, "A");
        assert_eq!(request.last_name, "B");
        assert_eq!(request.app_id, "x");
    }

    #[test]
    fn strings_are_not_trimmed_or_truncated() {
        let mut body = valid_body();
        let long_name = format!("  {}  ", "z".repeat(500));
        body["firstName"] = json!(long_name);
        body["cardBalance"] = json!(1234.5678);

        let request = validate(&body).unwrap();
        assert_eq!(request.first_name, long_name);
        assert_eq!(request.card_balance, 1234.5678);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut body = valid_body();
        body["promoCode"] = json!("SPRING");
        assert!(validate(&body).is_ok());
    }

    #[test]
    fn integer_balance_is_a_number() {
        let mut body = valid_body();
        body["cardBalance"] = json!(250);
        assert_eq!(validate(&body).unwrap().card_balance, 250.0);
    }

    #[test]
    fn integral_float_is_accepted_for_ids() {
        let mut body = valid_body();
        body["userId"] = json!(7.0);
        assert_eq!(validate(&body).unwrap().user_id, 7);
    }

    #[test]
    fn missing_phone_is_reported() {
        let mut body = valid_body();
        body.as_object_mut().unwrap().remove("phone");

        let err = validate(&body).unwrap_err();
        assert_eq!(
            err.issues(),
            &[FieldIssue {
                field: "phone",
                problem: FieldProblem::Missing,
            }]
        );
    }

    #[test]
    fn null_counts_as_missing() {
        let mut body = valid_body();
        body["currency"] = Value::Null;

        let err = validate(&body).unwrap_err();
        assert_eq!(err.issues()[0].problem, FieldProblem::Missing);
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let mut body = valid_body();
        body["userId"] = json!("1");
        body["cardRequestId"] = json!(" 100 ");
        body["cardBalance"] = json!("0.0");

        let request = validate(&body).unwrap();
        assert_eq!(request.user_id, 1);
        assert_eq!(request.card_request_id, 100);
        assert_eq!(request.card_balance, 0.0);

        body["userId"] = json!("7.0");
        body["cardBalance"] = json!("12.75");
        let request = validate(&body).unwrap();
        assert_eq!(request.user_id, 7);
        assert_eq!(request.card_balance, 12.75);
    }

    #[test]
    fn unparseable_numeric_strings_are_rejected() {
        let mut body = valid_body();
        body["userId"] = json!("1.5");
        body["cardBalance"] = json!("NaN");
        body["cardRequestId"] = json!("one hundred");

        let err = validate(&body).unwrap_err();
        let fields: Vec<_> = err.issues().iter().map(|i| i.field).collect();
        assert_eq!(fields, ["userId", "cardBalance", "cardRequestId"]);
    }

    #[test]
    fn wrong_types_are_all_reported() {
        let mut body = valid_body();
        body["userId"] = json!(true);
        body["cardBalance"] = json!([0.0]);
        body["lastName"] = json!(42);
        body["cardRequestId"] = json!(1.5);

        let err = validate(&body).unwrap_err();
        let fields: Vec<_> = err.issues().iter().map(|i| i.field).collect();
        assert_eq!(fields, ["userId", "cardBalance", "lastName", "cardRequestId"]);
        assert!(err.issues().iter().all(|i| matches!(
            i.problem,
            FieldProblem::WrongType { .. }
        )));
    }

    #[test]
    fn non_object_body_is_invalid() {
        assert_eq!(
            validate(&json!([1, 2, 3])).unwrap_err(),
            ValidationError::NotAnObject
        );
        assert_eq!(
            validate(&json!("hello")).unwrap_err(),
            ValidationError::NotAnObject
        );
    }

    #[test]
    fn empty_object_reports_all_ten_fields() {
        let err = validate(&json!({})).unwrap_err();
        assert_eq!(err.issues().len(), 10);
    }

    #[test]
    fn validation_is_deterministic() {
        let mut body = valid_body();
        body["phone"] = json!(true);
        assert_eq!(validate(&body), validate(&body));
        assert_eq!(validate(&valid_body()), validate(&valid_body()));
    }
}
