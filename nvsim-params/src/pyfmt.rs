/// Python's `repr(float)`: shortest round-trip digits, scientific notation when the decimal
/// exponent is below -4 or at least 16, and a trailing `.0` on integral values.
pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    // `{:e}` already yields the shortest digits that round-trip
    let sci = format!("{:e}", value);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(m) => ("-", m),
        None => ("", mantissa),
    };
    let digits = mantissa.replace('.', "");
    let decpt = exp + 1;
    if !(-3..=16).contains(&decpt) {
        let tail = if digits.len() > 1 {
            format!(".{}", &digits[1..])
        } else {
            String::new()
        };
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{}{}{}e{}{:02}", sign, &digits[..1], tail, exp_sign, exp.abs())
    } else if decpt <= 0 {
        format!("{}0.{}{}", sign, "0".repeat(decpt.unsigned_abs() as usize), digits)
    } else {
        let decpt = decpt as usize;
        if decpt >= digits.len() {
            format!("{}{}{}.0", sign, digits, "0".repeat(decpt - digits.len()))
        } else {
            format!("{}{}.{}", sign, &digits[..decpt], &digits[decpt..])
        }
    }
}
