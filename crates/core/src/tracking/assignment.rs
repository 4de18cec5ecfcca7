/// Minimum-cost one-to-one assignment (Hungarian / Kuhn-Munkres, O(n³)).
///
/// `cost[i][j]` is the cost of pairing row `i` with column `j`. Rectangular
/// matrices are padded to square with zero-cost dummy cells; pairs that land
/// on padding are not returned. Output pairs are `(row, col)` sorted by row.
pub fn hungarian_assignment(cost: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let n_rows = cost.len();
    let n_cols = cost.first().map_or(0, Vec::len);
    if n_rows == 0 || n_cols == 0 {
        return Vec::new();
    }

    let n = n_rows.max(n_cols);
    let cell = |i: usize, j: usize| -> f64 {
        if i < n_rows && j < n_cols {
            cost[i][j]
        } else {
            0.0
        }
    };

    // Potentials and matching are 1-indexed; column 0 is the augmenting source.
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; n + 1];
    let mut row_of_col = vec![0_usize; n + 1];
    let mut way = vec![0_usize; n + 1];

    for i in 1..=n {
        row_of_col[0] = i;
        let mut j0 = 0_usize;
        let mut min_val = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = row_of_col[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0_usize;

            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let reduced = cell(i0 - 1, j - 1) - u[i0] - v[j];
                if reduced < min_val[j] {
                    min_val[j] = reduced;
                    way[j] = j0;
                }
                if min_val[j] < delta {
                    delta = min_val[j];
                    j1 = j;
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[row_of_col[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_val[j] -= delta;
                }
            }

            j0 = j1;
            if row_of_col[j0] == 0 {
                break;
            }
        }

        loop {
            let prev = way[j0];
            row_of_col[j0] = row_of_col[prev];
            j0 = prev;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=n)
        .filter_map(|j| {
            let i = row_of_col[j];
            (i >= 1 && i <= n_rows && j <= n_cols).then(|| (i - 1, j - 1))
        })
        .collect();
    pairs.sort_unstable();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(cost: &[Vec<f64>], pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(i, j)| cost[i][j]).sum()
    }

    #[test]
    fn test_empty_inputs() {
        assert!(hungarian_assignment(&[]).is_empty());
        assert!(hungarian_assignment(&[vec![], vec![]]).is_empty());
    }

    #[test]
    fn test_identity_preference() {
        let cost = vec![
            vec![-0.9, -0.1, 0.0],
            vec![-0.2, -0.8, -0.1],
            vec![0.0, -0.1, -0.7],
        ];
        assert_eq!(hungarian_assignment(&cost), vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_beats_greedy_choice() {
        // Greedy takes (0,0) at -0.9 and is left with (1,1) at 0.0;
        // the optimum is (0,1) + (1,0) at -1.6.
        let cost = vec![vec![-0.9, -0.8], vec![-0.8, 0.0]];
        let pairs = hungarian_assignment(&cost);
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
        assert!((total(&cost, &pairs) + 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_more_rows_than_columns() {
        let cost = vec![vec![-0.1], vec![-0.9], vec![-0.5]];
        assert_eq!(hungarian_assignment(&cost), vec![(1, 0)]);
    }

    #[test]
    fn test_more_columns_than_rows() {
        let cost = vec![vec![-0.2, -0.7, -0.6]];
        assert_eq!(hungarian_assignment(&cost), vec![(0, 1)]);
    }

    #[test]
    fn test_every_row_and_column_used_at_most_once() {
        let cost: Vec<Vec<f64>> = (0..5)
            .map(|i| (0..4).map(|j| -(((i * 7 + j * 3) % 5) as f64) / 5.0).collect())
            .collect();
        let pairs = hungarian_assignment(&cost);
        assert_eq!(pairs.len(), 4);
        let mut rows: Vec<_> = pairs.iter().map(|p| p.0).collect();
        let mut cols: Vec<_> = pairs.iter().map(|p| p.1).collect();
        rows.dedup();
        cols.sort_unstable();
        cols.dedup();
        assert_eq!(rows.len(), 4);
        assert_eq!(cols.len(), 4);
    }
}
