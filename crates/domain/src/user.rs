use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;
use crate::zodiac::{Element, ZodiacSign};

/// 实时核心看到的用户资料（只读）。
///
/// `zodiac_sign` 保留原始标签：无法识别的标签照样透传给客户端，打分时按缺失处理。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub name: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub zodiac_sign: Option<String>,
    pub horoscope: Option<String>,
    pub height: Option<i32>,
    pub weight: Option<i32>,
    #[serde(default)]
    pub interests: Vec<String>,
}

impl UserProfile {
    /// 只有 id 和用户名的最小资料。
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            name: None,
            birthday: None,
            zodiac_sign: None,
            horoscope: None,
            height: None,
            weight: None,
            interests: Vec::new(),
        }
    }

    /// 设置星座标签，并在标签可识别时补上性格描述。
    pub fn with_zodiac(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        if self.horoscope.is_none() {
            self.horoscope = label
                .parse::<ZodiacSign>()
                .ok()
                .map(|sign| sign.horoscope().to_owned());
        }
        self.zodiac_sign = Some(label);
        self
    }

    /// 设置生日；没有星座标签时按生日推算。
    pub fn with_birthday(mut self, birthday: NaiveDate) -> Self {
        self.birthday = Some(birthday);
        if self.zodiac_sign.is_none() {
            return self.with_zodiac(ZodiacSign::from_birthday(birthday).as_str());
        }
        self
    }

    pub fn zodiac_label(&self) -> Option<&str> {
        self.zodiac_sign.as_deref()
    }

    pub fn zodiac(&self) -> Option<ZodiacSign> {
        self.zodiac_sign.as_deref()?.parse().ok()
    }

    pub fn element(&self) -> Option<Element> {
        self.zodiac().map(ZodiacSign::element)
    }

    pub fn daily_horoscope(&self) -> Option<&'static str> {
        self.zodiac().map(ZodiacSign::daily_horoscope)
    }

    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        self.birthday.map(|birthday| age_on(birthday, today))
    }
}

/// 计算周岁。生日在未来时返回 0。
pub fn age_on(birthday: NaiveDate, today: NaiveDate) -> u32 {
    let mut age = today.year() - birthday.year();
    if (today.month(), today.day()) < (birthday.month(), birthday.day()) {
        age -= 1;
    }
    age.max(0) as u32
}
