use uuid::Uuid;

/// 网关为每个客户端请求分配的追踪 ID。
pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let a = request_id();
        let b = request_id();
        assert!(a.starts_with("req-"));
        assert_ne!(a, b);
    }
}
