//! Cached user/group lookups for ownership metadata.

use std::{
	collections::HashMap,
	ffi::{CStr, CString},
};

/// Name↔id lookups backed by the system databases, memoized per pipeline run.
#[derive(Debug, Default)]
pub(crate) struct OwnerLookup {
	uid_by_name: HashMap<String, Option<u32>>,
	gid_by_name: HashMap<String, Option<u32>>,
	name_by_uid: HashMap<u32, Option<String>>,
	name_by_gid: HashMap<u32, Option<String>>,
}

impl OwnerLookup {
	pub(crate) fn uid_for_name(&mut self, name: &str) -> Option<u32> {
		if let Some(cached) = self.uid_by_name.get(name) {
			return *cached;
		}

		let uid = CString::new(name).ok().and_then(|cname| {
			// SAFETY: getpwnam returns a pointer into static storage or null;
			// we only read the uid field while the pointer is live.
			let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
			if pw.is_null() {
				None
			} else {
				Some(unsafe { (*pw).pw_uid })
			}
		});

		self.uid_by_name.insert(name.to_string(), uid);
		uid
	}

	pub(crate) fn gid_for_name(&mut self, name: &str) -> Option<u32> {
		if let Some(cached) = self.gid_by_name.get(name) {
			return *cached;
		}

		let gid = CString::new(name).ok().and_then(|cname| {
			// SAFETY: as above, for getgrnam.
			let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
			if gr.is_null() {
				None
			} else {
				Some(unsafe { (*gr).gr_gid })
			}
		});

		self.gid_by_name.insert(name.to_string(), gid);
		gid
	}

	pub(crate) fn name_for_uid(&mut self, uid: u32) -> Option<String> {
		if let Some(cached) = self.name_by_uid.get(&uid) {
			return cached.clone();
		}

		// SAFETY: getpwuid returns a pointer into static storage or null.
		let pw = unsafe { libc::getpwuid(uid) };
		let name = if pw.is_null() {
			None
		} else {
			// SAFETY: pw_name is a valid NUL-terminated string while pw is.
			Some(
				unsafe { CStr::from_ptr((*pw).pw_name) }
					.to_string_lossy()
					.into_owned(),
			)
		};

		self.name_by_uid.insert(uid, name.clone());
		name
	}

	pub(crate) fn name_for_gid(&mut self, gid: u32) -> Option<String> {
		if let Some(cached) = self.name_by_gid.get(&gid) {
			return cached.clone();
		}

		// SAFETY: getgrgid returns a pointer into static storage or null.
		let gr = unsafe { libc::getgrgid(gid) };
		let name = if gr.is_null() {
			None
		} else {
			// SAFETY: gr_name is a valid NUL-terminated string while gr is.
			Some(
				unsafe { CStr::from_ptr((*gr).gr_name) }
					.to_string_lossy()
					.into_owned(),
			)
		};

		self.name_by_gid.insert(gid, name.clone());
		name
	}
}

#[cfg(test)]
mod tests {
	use super::OwnerLookup;

	#[test]
	fn root_resolves_both_ways() {
		let mut lookup = OwnerLookup::default();

		let name = lookup.name_for_uid(0);
		assert!(name.is_some());

		let uid = lookup.uid_for_name(&name.expect("uid 0 has a name"));
		assert_eq!(uid, Some(0));

		// Cached negative lookups stay negative.
		assert_eq!(lookup.uid_for_name("no-such-user-xyzzy"), None);
		assert_eq!(lookup.uid_for_name("no-such-user-xyzzy"), None);
	}
}
