/// Produces the next disambiguated variant of a file name.
///
/// `"report.txt"` becomes `"report (2).txt"`, which in turn becomes
/// `"report (3).txt"`. Names without an extension, and dot-files such as
/// `".profile"`, get the suffix appended at the end. A counter that cannot be
/// incremented is kept as part of the name and a fresh ` (2)` is appended.
#[must_use]
pub fn next_file_name(name: &str) -> String {
	let (base, extension) = split_extension(name);

	let (stem, counter) = parse_counter(base)
		.and_then(|(stem, counter)| Some((stem, counter.checked_add(1)?)))
		.unwrap_or((base, 2));

	format!("{stem} ({counter}){extension}")
}

fn split_extension(name: &str) -> (&str, &str) {
	match name.rfind('.') {
		Some(0) | None => (name, ""),
		Some(dot) => name.split_at(dot),
	}
}

fn parse_counter(base: &str) -> Option<(&str, u32)> {
	let without_paren = base.strip_suffix(')')?;
	let open = without_paren.rfind(" (")?;
	let digits = &without_paren[open + 2..];

	if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}

	digits.parse().ok().map(|counter| (&base[..open], counter))
}
