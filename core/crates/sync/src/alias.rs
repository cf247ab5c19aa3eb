//! Objects declared equivalent to another object after a conflict.

use sd_sync::{Oid, Soid};

use tracing::warn;

use super::{
	db::{self, key, Tx, ALIASES},
	Error,
};

/// Longest alias chain followed before giving up.
const MAX_CHAIN: usize = 32;

pub fn add_alias(tx: &mut Tx, from: Soid, to: Oid) -> Result<(), Error> {
	if from.oid == to {
		return Err(Error::Invariant(format!("{from} cannot alias itself")));
	}

	if resolve(tx, from.with_oid(to))? == from {
		return Err(Error::Invariant(format!(
			"aliasing {from} to {to} would form a cycle"
		)));
	}

	tx.insert(ALIASES, &key::soid(from), &to)?;

	Ok(())
}

/// The object `soid` currently stands for, `soid` itself when it is not aliased.
pub fn resolve(tx: &Tx, soid: Soid) -> Result<Soid, db::Error> {
	let mut current = soid;

	for _ in 0..MAX_CHAIN {
		match tx.get::<Oid>(ALIASES, &key::soid(current))? {
			Some(target) => current = current.with_oid(target),
			None => return Ok(current),
		}
	}

	warn!(%soid, "Alias chain too long, using last resolved target;");
	Ok(current)
}
