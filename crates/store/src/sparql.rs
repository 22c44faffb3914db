//! Canonical query and update text used by the mining pipelines.
//!
//! The shapes are structurally fixed; hosts with a real SPARQL backend execute
//! them as-is, and the [`memory`](crate::memory) backend recognizes exactly
//! these shapes. Parameters use the late-binding `~name` convention.

use std::fmt::Write;

/// Per-root reconciliation query: one row per known descendant of `~root`,
/// selecting `(url, folder_urn?, mtime, extractor_hash?, mimetype?)`.
#[must_use]
pub fn reconciliation_query() -> String {
	"SELECT ?url ?folderUrn ?mtime ?hash ?mime WHERE { \
	 ?u nie:url ?url ; nfo:fileLastModified ?mtime . \
	 OPTIONAL { ?u nie:interpretedAs ?folderUrn . ?folderUrn a nfo:Folder } \
	 OPTIONAL { ?u tracker:extractorHash ?hash } \
	 OPTIONAL { ?u nie:mimeType ?mime } \
	 FILTER (?url = ~root || STRSTARTS (?url, CONCAT (~root, '/'))) }"
		.to_string()
}

fn push_graph_union(out: &mut String, priority_graphs: &[String]) {
	for graph in priority_graphs {
		write!(out, "{{ GRAPH <{graph}> {{ ?urn nie:url ?url ; nie:mimeType ?mime . }} }} UNION ")
			.expect("writing to a String cannot fail");
	}
	out.push_str("{ ?urn nie:url ?url ; nie:mimeType ?mime . }");
}

/// Remaining-work count for the decorator: resources with a known MIME type
/// and no recorded extractor hash, priority graphs unioned first.
#[must_use]
pub fn decorator_count_query(priority_graphs: &[String]) -> String {
	let mut out = String::from("SELECT COUNT(?urn) WHERE { ");
	push_graph_union(&mut out, priority_graphs);
	out.push_str(" FILTER NOT EXISTS { ?urn tracker:extractorHash ?hash } }");
	out
}

/// One page of decorator work, selecting `(urn, id, url, mime)`, with the same
/// union ordering as [`decorator_count_query`]. Bind `~offset` and `~limit`.
#[must_use]
pub fn decorator_page_query(priority_graphs: &[String]) -> String {
	let mut out = String::from("SELECT ?urn ?id ?url ?mime WHERE { ");
	push_graph_union(&mut out, priority_graphs);
	out.push_str(
		" ?urn tracker:id ?id . \
		 FILTER NOT EXISTS { ?urn tracker:extractorHash ?hash } } \
		 OFFSET ~offset LIMIT ~limit",
	);
	out
}

/// Deletes one resource and all its properties.
#[must_use]
pub fn delete_resource(url: &str) -> String {
	format!("DELETE WHERE {{ ?u nie:url \"{url}\" ; ?p ?o . }}")
}

/// Deletes every resource strictly below `url`.
#[must_use]
pub fn delete_descendants(url: &str) -> String {
	format!(
		"DELETE WHERE {{ ?u nie:url ?url ; ?p ?o . FILTER (STRSTARTS (?url, \"{url}/\")) }}"
	)
}

/// Rewrites the URL prefix of a resource and its descendants after a move.
#[must_use]
pub fn move_resource(from: &str, to: &str) -> String {
	format!(
		"DELETE {{ ?u nie:url ?url }} INSERT {{ ?u nie:url ?newUrl }} WHERE {{ \
		 ?u nie:url ?url . \
		 FILTER (?url = \"{from}\" || STRSTARTS (?url, \"{from}/\")) \
		 BIND (CONCAT (\"{to}\", SUBSTR (?url, STRLEN (\"{from}\") + 1)) AS ?newUrl) }}"
	)
}

/// Clears the recorded extractor hash so the decorator re-queues the resource.
#[must_use]
pub fn clear_extractor_hash(url: &str) -> String {
	format!("DELETE WHERE {{ ?u nie:url \"{url}\" ; tracker:extractorHash ?hash . }}")
}

/// Records a freshly extracted metadata hash.
#[must_use]
pub fn set_extractor_hash(urn: &str, hash: &str) -> String {
	format!("INSERT DATA {{ <{urn}> tracker:extractorHash \"{hash}\" }}")
}
