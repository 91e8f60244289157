//! Sensitive-field classification feeding the policy gate.
//!
//! Classification is heuristic but fails closed: a field the classifier
//! cannot place with confidence is reported as uncertain, which the gate
//! turns into an `ask`, never a silent allow.

use std::sync::LazyLock;

use regex_lite::Regex;
use strum_macros::Display;

use webpilot_protocol::InteractiveElement;

use crate::policy::ReasonCode;
use crate::redact;

/// Sensitivity class of the *field* being acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FieldClass {
    Generic,
    Pii,
    Sso,
    Payment,
    Credential,
}

/// Sensitivity class of the *text* about to be typed, when there is any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TextClass {
    Generic,
    Pii,
    Secret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldClassification {
    pub field: FieldClass,
    pub text: TextClass,
    /// The stricter of the two views; what the policy gate keys off.
    pub combined: FieldClass,
    pub reason_code: ReasonCode,
    /// False when metadata was too thin to classify with confidence.
    pub certain: bool,
}

static PAYMENT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)\b(card|cc[\-_ ]?(num|number|exp|csc|cvv|cvc)|cvv|cvc|iban|routing|swift|account[\-_ ]?number)\b")
        .expect("static regex")
});

static CREDENTIAL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)\b(password|passcode|passphrase|pin|otp|one[\-_ ]?time|2fa|mfa|totp|verification[\-_ ]?code)\b")
        .expect("static regex")
});

static SSO_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)\b(sso|saml|oidc|single[\-_ ]?sign)\b").expect("static regex")
});

static PII_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)\b(ssn|social[\-_ ]?security|passport|national[\-_ ]?id|driver'?s?[\-_ ]?licen[cs]e|date[\-_ ]?of[\-_ ]?birth|dob|email|e-mail|phone|tel|address|zip|postal)\b")
        .expect("static regex")
});

static EMAIL_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
});

static PHONE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\+?\d[\d \-()]{8,}\d").expect("static regex")
});

fn classify_autocomplete(tokens: &str) -> Option<FieldClass> {
    let tokens = tokens.to_ascii_lowercase();
    for token in tokens.split_whitespace() {
        match token {
            "current-password" | "new-password" | "one-time-code" => {
                return Some(FieldClass::Credential);
            }
            t if t.starts_with("cc-") => return Some(FieldClass::Payment),
            "username" | "email" | "tel" | "name" | "given-name" | "family-name"
            | "street-address" | "postal-code" | "bday" => return Some(FieldClass::Pii),
            _ => {}
        }
    }
    None
}

fn classify_text(hint: Option<&str>) -> TextClass {
    let Some(text) = hint else {
        return TextClass::Generic;
    };
    if redact::find_secret(text).is_some() {
        return TextClass::Secret;
    }
    if EMAIL_TEXT.is_match(text) || PHONE_TEXT.is_match(text) {
        return TextClass::Pii;
    }
    TextClass::Generic
}

/// Classify the field behind `element`, optionally refined by the text a
/// `browser.type` proposal intends to enter.
pub fn classify_field(
    element: &InteractiveElement,
    typed_text_hint: Option<&str>,
) -> FieldClassification {
    let text = classify_text(typed_text_hint);

    let meta = element.form.as_ref();
    let input_type = meta.and_then(|m| m.input_type.as_deref()).unwrap_or("");
    let mut haystack = String::new();
    if let Some(meta) = meta {
        if let Some(label) = &meta.label {
            haystack.push_str(label);
            haystack.push(' ');
        }
        if let Some(name) = &meta.name {
            haystack.push_str(name);
            haystack.push(' ');
        }
    }
    haystack.push_str(&element.accessible_name);

    let (field, reason_code, certain) = if input_type.eq_ignore_ascii_case("password") {
        (FieldClass::Credential, ReasonCode::ClassifierPasswordType, true)
    } else if let Some(class) = meta
        .and_then(|m| m.autocomplete.as_deref())
        .and_then(classify_autocomplete)
    {
        (class, ReasonCode::ClassifierAutocomplete, true)
    } else if CREDENTIAL_NAME.is_match(&haystack) {
        (FieldClass::Credential, ReasonCode::ClassifierNameHeuristic, true)
    } else if PAYMENT_NAME.is_match(&haystack) {
        (FieldClass::Payment, ReasonCode::ClassifierNameHeuristic, true)
    } else if SSO_NAME.is_match(&haystack) {
        (FieldClass::Sso, ReasonCode::ClassifierNameHeuristic, true)
    } else if PII_NAME.is_match(&haystack) {
        (FieldClass::Pii, ReasonCode::ClassifierNameHeuristic, true)
    } else if meta.is_none() && element.accessible_name.trim().is_empty() {
        // A bare control with no metadata at all: nothing to classify from.
        (FieldClass::Generic, ReasonCode::ClassifierInsufficient, false)
    } else {
        (FieldClass::Generic, ReasonCode::ClassifierGeneric, true)
    };

    // Secret-looking text upgrades whatever the field looked like.
    let combined = match text {
        TextClass::Secret => field.max(FieldClass::Credential),
        TextClass::Pii => field.max(FieldClass::Pii),
        TextClass::Generic => field,
    };
    let reason_code = if combined > field && text == TextClass::Secret {
        ReasonCode::ClassifierTextSecret
    } else {
        reason_code
    };

    FieldClassification {
        field,
        text,
        combined,
        reason_code,
        certain,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use webpilot_protocol::BoundingBox;
    use webpilot_protocol::FormFieldMeta;

    fn element(form: Option<FormFieldMeta>, name: &str) -> InteractiveElement {
        InteractiveElement {
            handle: "h1".to_string(),
            role: "textbox".to_string(),
            accessible_name: name.to_string(),
            bounds: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 100.0,
                height: 20.0,
            },
            form,
            attributes: Vec::new(),
        }
    }

    #[test]
    fn password_type_wins_over_everything() {
        let el = element(
            Some(FormFieldMeta {
                input_type: Some("password".to_string()),
                label: Some("Search".to_string()),
                required: false,
                autocomplete: None,
                name: None,
            }),
            "Search",
        );
        let c = classify_field(&el, None);
        assert_eq!(c.combined, FieldClass::Credential);
        assert_eq!(c.reason_code, ReasonCode::ClassifierPasswordType);
        assert!(c.certain);
    }

    #[test]
    fn autocomplete_cc_tokens_mean_payment() {
        let el = element(
            Some(FormFieldMeta {
                input_type: Some("text".to_string()),
                label: None,
                required: true,
                autocomplete: Some("cc-number".to_string()),
                name: None,
            }),
            "",
        );
        assert_eq!(classify_field(&el, None).combined, FieldClass::Payment);
    }

    #[test]
    fn bare_control_is_uncertain() {
        let el = element(None, "");
        let c = classify_field(&el, None);
        assert!(!c.certain);
        assert_eq!(c.reason_code, ReasonCode::ClassifierInsufficient);
    }

    #[test]
    fn secret_text_upgrades_a_generic_field() {
        let el = element(
            Some(FormFieldMeta {
                input_type: Some("text".to_string()),
                label: Some("Notes".to_string()),
                required: false,
                autocomplete: None,
                name: Some("notes".to_string()),
            }),
            "Notes",
        );
        let c = classify_field(&el, Some("api_key=sk_live_0123456789abcdef"));
        assert_eq!(c.text, TextClass::Secret);
        assert_eq!(c.combined, FieldClass::Credential);
        assert_eq!(c.reason_code, ReasonCode::ClassifierTextSecret);
    }

    #[test]
    fn ordinary_search_box_is_generic() {
        let el = element(
            Some(FormFieldMeta {
                input_type: Some("text".to_string()),
                label: Some("Search".to_string()),
                required: false,
                autocomplete: None,
                name: Some("q".to_string()),
            }),
            "Search",
        );
        let c = classify_field(&el, Some("weather in oslo"));
        assert_eq!(c.combined, FieldClass::Generic);
        assert!(c.certain);
    }
}
