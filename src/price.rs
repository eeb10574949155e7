/// Decode FCA's packed price encoding into whole currency units.
///
/// Invoices print amounts as zero-padded digit runs with two implied decimal
/// places, e.g. `05662000` for 56 620. Non-digits are ignored; one leading
/// zero and the last two digits are dropped. Fewer than four digits, or
/// anything that does not parse, decodes to 0.
pub fn decode(raw: &str) -> u64 {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return 0;
    }

    let digits = digits.strip_prefix('0').unwrap_or(&digits);
    // Truncate the cents; never round.
    let whole = &digits[..digits.len() - 2];
    whole.parse::<u64>().unwrap_or(0)
}
