//! 章节树扁平化。
//!
//! 把远端返回的嵌套章节树按前序展开成线性序列，供选章、抓取与导出使用。

use std::collections::HashSet;

use super::models::{ChapterNode, DownloadError};

/// 深度优先前序遍历：父节点先于全部后代，兄弟保持源顺序。
///
/// 用显式栈迭代展开，并按章节 id 维护 visited 集合；同一 id 第二次出现
/// 视为树结构损坏（环或重复节点），返回结构错误而不是无界递归。
pub fn flatten_chapters(tree: &[ChapterNode]) -> Result<Vec<ChapterNode>, DownloadError> {
    let mut flat: Vec<ChapterNode> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&ChapterNode> = tree.iter().rev().collect();

    while let Some(node) = stack.pop() {
        if !seen.insert(node.id.as_str()) {
            return Err(DownloadError::CyclicTree(node.id.clone()));
        }
        flat.push(node.clone());
        for child in node.children.iter().rev() {
            stack.push(child);
        }
    }

    Ok(flat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, children: Vec<ChapterNode>) -> ChapterNode {
        ChapterNode {
            id: id.to_string(),
            title: format!("Chapter {id}"),
            children,
            ..ChapterNode::default()
        }
    }

    fn ids(chapters: &[ChapterNode]) -> Vec<&str> {
        chapters.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn preorder_parent_before_descendants() {
        let tree = vec![
            node("a", vec![node("a1", vec![node("a1x", vec![])]), node("a2", vec![])]),
            node("b", vec![node("b1", vec![])]),
        ];

        let flat = flatten_chapters(&tree).unwrap();
        assert_eq!(ids(&flat), ["a", "a1", "a1x", "a2", "b", "b1"]);
    }

    #[test]
    fn length_equals_total_node_count() {
        let tree = vec![node("r", vec![node("c1", vec![]), node("c2", vec![node("g", vec![])])])];
        assert_eq!(flatten_chapters(&tree).unwrap().len(), 4);
    }

    #[test]
    fn flatten_of_flat_list_is_idempotent() {
        let flat_input = vec![node("1", vec![]), node("2", vec![]), node("3", vec![])];

        let once = flatten_chapters(&flat_input).unwrap();
        let twice = flatten_chapters(&once).unwrap();

        assert_eq!(ids(&once), ids(&flat_input));
        assert_eq!(ids(&twice), ids(&once));
    }

    #[test]
    fn duplicate_node_id_is_a_structural_error() {
        let tree = vec![node("a", vec![node("dup", vec![])]), node("dup", vec![])];

        match flatten_chapters(&tree) {
            Err(DownloadError::CyclicTree(id)) => assert_eq!(id, "dup"),
            other => panic!("expected CyclicTree error, got {other:?}"),
        }
    }
}
