//! Choosing hosts for the blocks of a file
//!
//! The planner is pure: it works on a snapshot of the online nodes and
//! their free bytes, so the whole policy can be tested without a mesh.
use trastero_meta::schema::NodeLabel;

/// One online node as seen by the planner
#[derive(Debug, Clone)]
pub struct Candidate {
	pub label: NodeLabel,
	pub free_bytes: u64,
}

/// The chosen hosts for one block, plus the fallback order to walk
/// when a chosen host fails
#[derive(Debug, Clone)]
pub struct BlockPlan {
	pub size: u64,
	pub original: NodeLabel,
	pub replica: NodeLabel,
	/// Every candidate in the preference order of this block
	pub fallbacks: Vec<NodeLabel>,
}

/// Split a byte count into block sizes: all blocks equal to
/// `block_size` except the last one, which holds the remainder
pub fn split_sizes(total: u64, block_size: u64) -> Vec<u64> {
	let mut sizes = vec![];
	let mut left = total;
	while left > block_size {
		sizes.push(block_size);
		left -= block_size;
	}
	sizes.push(left);
	sizes
}

/// Assign an original and a replica host to every block of a file of
/// `total_size` bytes. `None` means the group cannot take the upload:
/// fewer than two online nodes, not enough aggregate room for two
/// copies, or no pair of nodes left for some block.
pub fn plan_placement(
	nodes: &[Candidate],
	total_size: u64,
	block_size: u64,
) -> Option<Vec<BlockPlan>> {
	if nodes.len() < 2 {
		return None;
	}
	let aggregate: u64 = nodes.iter().map(|n| n.free_bytes).sum();
	if aggregate < 2 * total_size {
		return None;
	}

	let mut free = nodes.to_vec();
	let mut plans = vec![];

	for size in split_sizes(total_size, block_size) {
		// most free bytes first, lowest label on ties
		free.sort_by(|a, b| {
			b.free_bytes
				.cmp(&a.free_bytes)
				.then(a.label.cmp(&b.label))
		});

		let eligible = free
			.iter()
			.filter(|n| n.free_bytes >= size)
			.map(|n| n.label)
			.collect::<Vec<_>>();
		if eligible.len() < 2 {
			return None;
		}
		let original = eligible[0];
		let replica = eligible[1];

		for n in free.iter_mut() {
			if n.label == original || n.label == replica {
				n.free_bytes -= size;
			}
		}

		plans.push(BlockPlan {
			size,
			original,
			replica,
			fallbacks: eligible,
		});
	}

	Some(plans)
}

#[cfg(test)]
mod tests {
	use super::*;

	const MIB: u64 = 1024 * 1024;

	fn candidates(free: &[(u32, u64)]) -> Vec<Candidate> {
		free.iter()
			.map(|(k, b)| Candidate {
				label: NodeLabel(*k),
				free_bytes: *b,
			})
			.collect()
	}

	#[test]
	fn test_split_sizes() {
		// 2,500,000 bytes cut into 1 MiB blocks
		assert_eq!(
			split_sizes(2_500_000, MIB),
			vec![1_048_576, 1_048_576, 402_848]
		);
		assert_eq!(split_sizes(MIB, MIB), vec![MIB]);
		assert_eq!(split_sizes(3, MIB), vec![3]);
	}

	#[test]
	fn test_two_node_upload() {
		// two empty 100 MiB nodes, a 2,500,000 byte file
		let plans =
			plan_placement(&candidates(&[(1, 100 * MIB), (2, 100 * MIB)]), 2_500_000, MIB)
				.unwrap();
		assert_eq!(plans.len(), 3);
		assert_eq!(
			plans.iter().map(|p| p.size).collect::<Vec<_>>(),
			vec![1_048_576, 1_048_576, 402_848]
		);
		for p in plans.iter() {
			// one host gets the original, the other the replica
			assert_ne!(p.original, p.replica);
		}
	}

	#[test]
	fn test_three_node_spread() {
		// three empty 100 MiB nodes, four full-size blocks
		let plans = plan_placement(
			&candidates(&[(1, 100 * MIB), (2, 100 * MIB), (3, 100 * MIB)]),
			4 * MIB,
			MIB,
		)
		.unwrap();
		assert_eq!(plans.len(), 4);

		for p in plans.iter() {
			assert_ne!(p.original, p.replica);
		}
		// originals are spread: no node holds more than two of the four
		for k in 1..=3 {
			let originals = plans
				.iter()
				.filter(|p| p.original == NodeLabel(k))
				.count();
			assert!(originals <= 2, "nodo{} holds {} originals", k, originals);
		}
	}

	#[test]
	fn test_greatest_free_bytes_wins() {
		let plans = plan_placement(
			&candidates(&[(1, 10 * MIB), (2, 50 * MIB), (3, 30 * MIB)]),
			MIB,
			MIB,
		)
		.unwrap();
		assert_eq!(plans[0].original, NodeLabel(2));
		assert_eq!(plans[0].replica, NodeLabel(3));
	}

	#[test]
	fn test_ties_break_by_lowest_label() {
		let plans = plan_placement(
			&candidates(&[(3, 50 * MIB), (1, 50 * MIB), (2, 50 * MIB)]),
			MIB,
			MIB,
		)
		.unwrap();
		assert_eq!(plans[0].original, NodeLabel(1));
		assert_eq!(plans[0].replica, NodeLabel(2));
	}

	#[test]
	fn test_single_node_is_refused() {
		assert!(plan_placement(&candidates(&[(1, 100 * MIB)]), 1, MIB).is_none());
	}

	#[test]
	fn test_aggregate_capacity_is_checked() {
		// two copies of 3 MiB do not fit in 5 MiB of aggregate room
		assert!(plan_placement(
			&candidates(&[(1, 3 * MIB), (2, 2 * MIB)]),
			3 * MIB,
			MIB
		)
		.is_none());
	}

	#[test]
	fn test_fragmented_capacity_is_refused() {
		// enough bytes in aggregate, but no two nodes can take the
		// second block
		let plans = plan_placement(
			&candidates(&[(1, 2 * MIB), (2, MIB + MIB / 2), (3, MIB / 2)]),
			2 * MIB,
			MIB,
		);
		assert!(plans.is_none());
	}

	#[test]
	fn test_capacity_is_decremented_while_planning() {
		// nodo1 has room for exactly one block: once the first block
		// lands on it, the second one must pick other hosts
		let plans = plan_placement(
			&candidates(&[(1, MIB + MIB / 2), (2, MIB), (3, 10 * MIB)]),
			2 * MIB,
			MIB,
		)
		.unwrap();
		assert_eq!(plans[0].original, NodeLabel(3));
		assert_eq!(plans[0].replica, NodeLabel(1));
		assert_eq!(plans[1].original, NodeLabel(3));
		assert_eq!(plans[1].replica, NodeLabel(2));
	}
}
