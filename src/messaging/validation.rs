/// 消息驗證器
///
/// 消費端驗證失敗的消息會被拒絕且不重新排隊；
/// 發佈端驗證失敗則直接回傳錯誤給呼叫者。
pub trait MessageValidator<T>: Send + Sync + 'static {
    /// 驗證消息，失敗時回傳錯誤描述
    fn try_validate(&self, message: &T) -> Result<(), String>;
}

/// 為閉包實現驗證器
impl<T, F> MessageValidator<T> for F
where
    F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
{
    fn try_validate(&self, message: &T) -> Result<(), String> {
        self(message)
    }
}

/// 不做任何檢查的驗證器
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl<T> MessageValidator<T> for AcceptAll {
    fn try_validate(&self, _message: &T) -> Result<(), String> {
        Ok(())
    }
}
