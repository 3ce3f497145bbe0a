use anyhow::Result;
use somna_memory::{ArtifactStore, KeywordIndex};

pub(crate) async fn run_memory_keywords(store: &ArtifactStore) -> Result<()> {
    let index = store.index().await?;
    for line in keyword_lines(&index) {
        println!("{line}");
    }
    println!("({} keywords total)", index.len());
    Ok(())
}

pub(crate) async fn run_memory_search(store: &ArtifactStore, keywords: &[String]) -> Result<()> {
    let ids = store.search(keywords).await;
    if ids.is_empty() {
        println!("no artifacts indexed under {}", keywords.join(", "));
    }
    for id in &ids {
        println!("{id}");
    }
    Ok(())
}

pub(crate) async fn run_memory_forget(store: &ArtifactStore, keywords: &[String]) -> Result<()> {
    let removed = store.forget(keywords).await?;
    println!("forgot {removed} keyword(s)");
    Ok(())
}

fn keyword_lines(index: &KeywordIndex) -> Vec<String> {
    index
        .all_keywords()
        .into_iter()
        .map(|keyword| {
            let count = index.ids_for(&keyword).map_or(0, |ids| ids.len());
            format!("  {keyword:<24} {count}")
        })
        .collect()
}
