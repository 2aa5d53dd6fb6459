//! Validation engine and format heuristics
//!
//! Validators are plain functions with one canonical signature
//! `(value, text, jurisdiction, rules) -> bool`, resolved by name through a
//! registry populated at classifier construction: builtins under their bare
//! name, jurisdiction-local functions under a `"<JUR>:<name>"` scoped key, and
//! fully-qualified dotted names as exact keys. Unknown names validate as true;
//! a validator that panics counts as invalid. Nothing propagates past this
//! boundary.

use chrono::{Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

pub type RuleParams = BTreeMap<String, serde_json::Value>;

/// Canonical validator signature: (value, full text, jurisdiction, rules).
pub type ValidatorFn = fn(&str, &str, &str, &RuleParams) -> bool;

pub struct ValidatorRegistry {
    validators: HashMap<String, ValidatorFn>,
}

impl ValidatorRegistry {
    /// Registry pre-populated with the generic builtin validators.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            validators: HashMap::new(),
        };
        registry.register("always_true", |_, _, _, _| true);
        registry.register("validate_email", validate_email);
        registry.register("validate_credit_card", validate_credit_card);
        registry.register("validate_us_itin", validate_us_itin);
        registry.register("validate_api_key", validate_api_key);
        registry
    }

    pub fn register(&mut self, name: &str, validator: ValidatorFn) {
        self.validators.insert(name.to_string(), validator);
    }

    /// Register a validator visible only when resolving for `jurisdiction`.
    pub fn register_scoped(&mut self, jurisdiction: &str, name: &str, validator: ValidatorFn) {
        self.validators
            .insert(format!("{}:{}", jurisdiction.to_uppercase(), name), validator);
    }

    /// Resolve `name` and invoke it. Dotted names resolve as exact keys,
    /// bare names first in the jurisdiction scope and then globally.
    pub fn validate(
        &self,
        name: &str,
        value: &str,
        text: &str,
        jurisdiction: &str,
        rules: &RuleParams,
    ) -> bool {
        let resolved = if name.contains('.') {
            self.validators.get(name)
        } else {
            self.validators
                .get(&format!("{}:{}", jurisdiction.to_uppercase(), name))
                .or_else(|| self.validators.get(name))
        };

        let Some(validator) = resolved else {
            debug!("Unknown validator '{}', accepting by default", name);
            return true;
        };

        match catch_unwind(AssertUnwindSafe(|| {
            validator(value, text, jurisdiction, rules)
        })) {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(
                    "Validator '{}' panicked for jurisdiction '{}', treating as invalid",
                    name, jurisdiction
                );
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Generic heuristics
// ---------------------------------------------------------------------------

/// True when the value contains any alphabetic character.
pub fn contains_letters(value: &str) -> bool {
    value.chars().any(|c| c.is_alphabetic())
}

pub fn count_alphabetic(value: &str) -> usize {
    value.chars().filter(|c| c.is_alphabetic()).count()
}

fn digit_run(s: &str, min_run: usize, step: i8) -> bool {
    let digits: Vec<i8> = s
        .chars()
        .filter(|c| c.is_ascii_digit())
        .map(|c| c as i8 - b'0' as i8)
        .collect();
    // Values with separators or letters are exempt; only pure digit strings
    // encode the synthetic sequences this guards against.
    if digits.len() < min_run || digits.len() != s.chars().count() {
        return false;
    }

    let mut run = 1;
    for window in digits.windows(2) {
        if window[1] == window[0] + step {
            run += 1;
            if run >= min_run {
                return true;
            }
        } else {
            run = 1;
        }
    }
    false
}

/// Run of >= 5 digits each exactly one more than the previous ("123456").
pub fn has_consecutive_increasing_digits(s: &str) -> bool {
    digit_run(s, 5, 1)
}

/// Run of >= 5 digits each exactly one less than the previous ("987654").
pub fn has_consecutive_decreasing_digits(s: &str) -> bool {
    digit_run(s, 5, -1)
}

/// Run of >= 5 identical digits ("111111").
pub fn has_consecutive_repeating_digits(s: &str) -> bool {
    digit_run(s, 5, 0)
}

fn has_synthetic_digit_run(s: &str) -> bool {
    has_consecutive_increasing_digits(s)
        || has_consecutive_decreasing_digits(s)
        || has_consecutive_repeating_digits(s)
}

/// True when the span [start, end) is not embedded in a larger numeric or
/// decimal literal: the character directly before/after must not be a digit,
/// nor a decimal point flanked by a digit. Out-of-bounds neighbours pass.
pub fn is_not_part_of_decimal(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();

    if start > 0 {
        match bytes.get(start - 1) {
            Some(b) if b.is_ascii_digit() => return false,
            Some(&b'.') if start >= 2 && bytes[start - 2].is_ascii_digit() => return false,
            _ => {}
        }
    }

    if end < bytes.len() {
        match bytes[end] {
            b if b.is_ascii_digit() => return false,
            b'.' if end + 1 < bytes.len() && bytes[end + 1].is_ascii_digit() => return false,
            _ => {}
        }
    }

    true
}

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)$")
        .expect("ipv4 regex")
});

static IPV6_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-fA-F0-9]{1,4}:){7}[a-fA-F0-9]{1,4}$|^::(?:[a-fA-F0-9]{1,4}:){0,5}[a-fA-F0-9]{1,4}$|^(?:[a-fA-F0-9]{1,4}:){1,6}:$")
        .expect("ipv6 regex")
});

pub fn is_valid_ip(value: &str) -> bool {
    IPV4_RE.is_match(value) || IPV6_RE.is_match(value)
}

/// Birth-context keywords in English plus the localized forms the detectors
/// must honour (German, French, Spanish, Finnish, Dutch, Swedish).
static BIRTH_CONTEXT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?im)(Birth|DOB|Birthdate|Born|D\.O\.B\.",
        r"|Geburtsdatum|Geburtstag|geboren\s+am|Geb\.\s*Datum",
        r"|Date\s+de\s+naissance|DDN|N[eé]\(e\)\s+le|Date\s+de\s+n\.",
        r"|Fecha\s+de\s+nacimiento|F\.N\.|Nacimiento|Nacido\s+el|Fecha\s+nacimiento",
        r"|Syntym[aä]aika|Syntym[aä]p[aä]iv[aä]|Syntym[aä]|Syntynyt",
        r"|Geboortedatum|Geboren\s+op|Geboorte|Geb\.\s*datum",
        r"|F[oö]delsedatum|F[oö]dd\s+den|F[oö]delsedag|F[oö]dd|F\.d\.)",
    ))
    .expect("birth context regex")
});

const BIRTH_CONTEXT_WINDOW: usize = 100;

fn clamp_to_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// True when a birth-context keyword appears within a bounded window around
/// the candidate span.
pub fn has_birth_context(text: &str, start: usize, end: usize) -> bool {
    let lo = clamp_to_char_boundary(text, start.saturating_sub(BIRTH_CONTEXT_WINDOW));
    let hi = clamp_to_char_boundary(text, (end + BIRTH_CONTEXT_WINDOW).min(text.len()));
    BIRTH_CONTEXT_RE.is_match(&text[lo..hi])
}

const DATE_FORMATS: [&str; 3] = ["%d-%m-%Y", "%m-%d-%Y", "%Y-%m-%d"];

/// Parse a candidate birth date after normalizing `.` and `/` separators.
pub fn parse_birth_date(value: &str) -> Option<NaiveDate> {
    let normalized = value.replace(['.', '/'], "-");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&normalized, fmt).ok())
}

fn is_plausible_birth_date(value: &str) -> bool {
    let Some(date) = parse_birth_date(value) else {
        return false;
    };
    let today = Utc::now().date_naive();
    if date > today {
        return false;
    }
    today.year() - date.year() <= 120
}

// ---------------------------------------------------------------------------
// Named validators (canonical signature)
// ---------------------------------------------------------------------------

fn digits_of(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// US SSN structural rules: nine digits, area not 000/666/900+, group not 00,
/// serial not 0000.
pub fn validate_us_ssn(value: &str, _text: &str, _jurisdiction: &str, _rules: &RuleParams) -> bool {
    let digits = digits_of(value);
    if digits.len() != 9 || digits.len() != value.chars().filter(|c| !"- ".contains(*c)).count() {
        return false;
    }
    let area: u16 = match digits[0..3].parse() {
        Ok(n) => n,
        Err(_) => return false,
    };
    let group: u8 = match digits[3..5].parse() {
        Ok(n) => n,
        Err(_) => return false,
    };
    let serial: u16 = match digits[5..9].parse() {
        Ok(n) => n,
        Err(_) => return false,
    };
    !(area == 0 || area == 666 || area >= 900 || group == 0 || serial == 0)
}

/// US ITIN rules: nine digits, leading 9, group in 70-88, 90-92 or 94-99.
pub fn validate_us_itin(value: &str, _text: &str, _jurisdiction: &str, _rules: &RuleParams) -> bool {
    let digits = digits_of(value);
    if digits.len() != 9 || !digits.starts_with('9') {
        return false;
    }
    let group: u8 = match digits[3..5].parse() {
        Ok(n) => n,
        Err(_) => return false,
    };
    matches!(group, 70..=88 | 90..=92 | 94..=99)
}

fn luhn_checksum_ok(digits: &str) -> bool {
    let mut sum = 0u32;
    let mut alternate = false;
    for c in digits.chars().rev() {
        let Some(mut digit) = c.to_digit(10) else {
            return false;
        };
        if alternate {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
        alternate = !alternate;
    }
    sum % 10 == 0
}

/// Payment card numbers: 12-19 digits passing the Luhn checksum.
pub fn validate_credit_card(
    value: &str,
    _text: &str,
    _jurisdiction: &str,
    _rules: &RuleParams,
) -> bool {
    let digits = digits_of(value);
    (12..=19).contains(&digits.len()) && luhn_checksum_ok(&digits)
}

/// US bank account numbers: 6-17 digits, no letters, no synthetic runs, and
/// a total value no longer than 15 characters.
pub fn validate_bank_account_number(
    value: &str,
    _text: &str,
    _jurisdiction: &str,
    _rules: &RuleParams,
) -> bool {
    let digits = digits_of(value);
    let length_ok = (6..=17).contains(&digits.len());
    value.chars().count() <= 15
        && length_ok
        && !contains_letters(value)
        && !has_synthetic_digit_run(value)
}

pub fn validate_phone_number(
    value: &str,
    _text: &str,
    _jurisdiction: &str,
    _rules: &RuleParams,
) -> bool {
    let len = value.chars().count();
    (7..=30).contains(&len) && !has_synthetic_digit_run(value)
}

pub fn validate_email(value: &str, _text: &str, _jurisdiction: &str, _rules: &RuleParams) -> bool {
    value.contains('@') && value.contains('.')
}

pub fn validate_api_key(value: &str, _text: &str, _jurisdiction: &str, _rules: &RuleParams) -> bool {
    value.chars().count() >= 8 && value.chars().any(|c| c.is_ascii_digit())
}

/// Date of birth: parses as a calendar date, not in the future, age <= 120.
/// Birth-context gating happens in the span-aware format validator.
pub fn validate_date_of_birth(
    value: &str,
    _text: &str,
    _jurisdiction: &str,
    _rules: &RuleParams,
) -> bool {
    is_plausible_birth_date(value)
}

// ---------------------------------------------------------------------------
// Per-kind format validation
// ---------------------------------------------------------------------------

/// Closed set of canonical entity kinds used by the generic format validator
/// and the decimal-adjacency filter. Derived from the entity id or its
/// display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Ssn,
    Itin,
    CreditCard,
    Phone,
    BankAccount,
    RoutingNumber,
    Iban,
    Bban,
    Passport,
    DriverLicense,
    ApiKey,
    IpAddress,
    Email,
    Name,
    DateOfBirth,
    MedicalRecord,
    HealthInsurance,
    VehicleVin,
    LicensePlate,
    Other,
}

impl EntityKind {
    /// Map an entity id or display name onto its canonical kind.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "ssn" | "us_ssn" => Self::Ssn,
            "itin" | "us_itin" => Self::Itin,
            "credit_card" | "credit_card_number" => Self::CreditCard,
            "phone" | "phone_number" | "contact_number" | "telephone_number" => Self::Phone,
            "bank_account" | "bank_account_number" | "us_bank_number" => Self::BankAccount,
            "routing_number" | "bank_routing_number" => Self::RoutingNumber,
            "iban" | "iban_code" => Self::Iban,
            "bban" | "bban_code" => Self::Bban,
            "passport" | "passport_number" | "us_passport" => Self::Passport,
            "driver_license" | "driver_license_number" | "us_driver_license" => Self::DriverLicense,
            "api_key" => Self::ApiKey,
            "ip_address" | "ipv4" | "ipv6" => Self::IpAddress,
            "email" | "email_address" => Self::Email,
            "name" | "person" | "person_name" => Self::Name,
            "date_of_birth" | "dob" => Self::DateOfBirth,
            "medical_record_number" => Self::MedicalRecord,
            "health_insurance_number" => Self::HealthInsurance,
            "vehicle_vin" => Self::VehicleVin,
            "license_plate" | "license_plate_number" => Self::LicensePlate,
            _ => Self::Other,
        }
    }

    /// Kinds whose matches may be fragments of larger numeric literals; the
    /// decimal-adjacency filter applies only to these.
    pub fn is_numeric_like(&self) -> bool {
        matches!(
            self,
            Self::Ssn
                | Self::Itin
                | Self::CreditCard
                | Self::Phone
                | Self::BankAccount
                | Self::RoutingNumber
                | Self::DriverLicense
        )
    }
}

fn numeric_length_ok(kind: EntityKind, value: &str) -> bool {
    let digits = digits_of(value);
    match kind {
        EntityKind::Ssn => {
            digits.len() == 9
                && validate_us_ssn(value, "", "", &RuleParams::new())
        }
        EntityKind::Itin => {
            digits.len() == 9
                && validate_us_itin(value, "", "", &RuleParams::new())
        }
        EntityKind::CreditCard => (12..=19).contains(&digits.len()),
        EntityKind::Phone => (7..=30).contains(&digits.len()),
        EntityKind::BankAccount => (6..=17).contains(&digits.len()),
        EntityKind::RoutingNumber => digits.len() == 9,
        _ => true,
    }
}

/// Generic per-kind format validation over the extracted value. `start`/`end`
/// locate the value in `text` for context-sensitive kinds.
pub fn validate_format(label: &str, value: &str, text: &str, start: usize, end: usize) -> bool {
    validate_format_kind(EntityKind::from_label(label), value, text, start, end)
}

pub fn validate_format_kind(
    kind: EntityKind,
    value: &str,
    text: &str,
    start: usize,
    end: usize,
) -> bool {
    match kind {
        EntityKind::IpAddress => value.len() > 6 && is_valid_ip(value),
        EntityKind::Email => value.contains('@') && value.contains('.'),
        EntityKind::Name => {
            value.chars().count() > 5 && value.chars().filter(|c| c.is_ascii_digit()).count() < 3
        }
        EntityKind::DateOfBirth => {
            value.chars().count() >= 8
                && has_birth_context(text, start, end)
                && is_plausible_birth_date(value)
        }
        EntityKind::Ssn
        | EntityKind::CreditCard
        | EntityKind::Itin
        | EntityKind::Phone
        | EntityKind::BankAccount => {
            !contains_letters(value)
                && numeric_length_ok(kind, value)
                && !has_synthetic_digit_run(value)
        }
        EntityKind::RoutingNumber => {
            !contains_letters(value)
                && numeric_length_ok(kind, value)
                && !has_synthetic_digit_run(value)
        }
        EntityKind::Iban | EntityKind::Bban | EntityKind::Passport | EntityKind::DriverLicense => {
            value.chars().count() >= 8
                && value.chars().any(|c| c.is_ascii_digit())
                && !(matches!(kind, EntityKind::Passport | EntityKind::DriverLicense)
                    && count_alphabetic(value) > 4)
                && !has_synthetic_digit_run(value)
        }
        EntityKind::ApiKey => value.chars().count() >= 8 && value.chars().any(|c| c.is_ascii_digit()),
        EntityKind::MedicalRecord | EntityKind::HealthInsurance | EntityKind::LicensePlate => {
            value.chars().any(|c| c.is_ascii_digit())
        }
        EntityKind::VehicleVin | EntityKind::Other => true,
    }
}
